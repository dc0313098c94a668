//! Process-wide `type_id -> factory` mapping, immutable after [`crate::init`].

use super::types::{
	ChannelPacket, CustomPacket, ExitPacket, GenericPacket, ObjectCreationPacket,
	ObjectDeathPacket, ObjectUpdatePacket, PingPacket, RateAdjustPacket,
};
use super::Packet;
use crate::error::{Error, ErrorKind};

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

/// Ids below this are reserved for packet types defined by this crate.
pub const MIN_USER_ID: u8 = 64;

type Factory = fn() -> Box<dyn Packet>;

fn registry() -> &'static Mutex<HashMap<u8, Factory>> {
	static REGISTRY: OnceLock<Mutex<HashMap<u8, Factory>>> = OnceLock::new();
	REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register `factory` under `type_id`.
///
/// Fails with [`ErrorKind::DuplicatePacketType`] if the id is already taken. Intended to
/// be called once per type, either by [`init_builtin`] at [`crate::init`] time or by an
/// application registering its own types (at or above [`MIN_USER_ID`]) before any
/// connection is opened; the registry is treated as read-only afterwards.
pub fn register(type_id: u8, factory: Factory) -> Result<(), Error> {
	let mut map = registry().lock().unwrap();
	if map.contains_key(&type_id) {
		return Err(Error::new(ErrorKind::DuplicatePacketType));
	}
	map.insert(type_id, factory);
	Ok(())
}

/// Construct a fresh, empty instance of whatever type is registered at `type_id`.
pub(crate) fn create(type_id: u8) -> Result<Box<dyn Packet>, Error> {
	let map = registry().lock().unwrap();
	match map.get(&type_id) {
		Some(factory) => Ok(factory()),
		None => Err(Error::new(ErrorKind::UnknownPacket)),
	}
}

/// Register every built-in packet type. Idempotent: called from [`crate::init`] behind
/// a `std::sync::Once`, so double-registration across repeated `init()` calls within a
/// single process never trips [`ErrorKind::DuplicatePacketType`].
pub(crate) fn init_builtin() {
	let mut map = registry().lock().unwrap();
	map.entry(0).or_insert(|| Box::new(ExitPacket::new()) as Box<dyn Packet>);
	map.entry(1).or_insert(|| Box::new(GenericPacket::new()) as Box<dyn Packet>);
	map.entry(2).or_insert(|| Box::new(PingPacket::new()) as Box<dyn Packet>);
	map.entry(3).or_insert(|| Box::new(RateAdjustPacket::new()) as Box<dyn Packet>);
	map.entry(4).or_insert(|| Box::new(CustomPacket::new(Vec::new())) as Box<dyn Packet>);
	map.entry(5).or_insert(|| Box::new(ChannelPacket::new(0, 0, None)) as Box<dyn Packet>);
	map.entry(6).or_insert(|| Box::new(ObjectCreationPacket::new(0, None)) as Box<dyn Packet>);
	map.entry(7).or_insert(|| Box::new(ObjectUpdatePacket::new(0, None)) as Box<dyn Packet>);
	map.entry(8).or_insert(|| Box::new(ObjectDeathPacket::new(0, None)) as Box<dyn Packet>);
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn duplicate_registration_is_rejected() {
		crate::init();
		assert_eq!(
			register(0, || Box::new(ExitPacket::new())).unwrap_err().kind(),
			ErrorKind::DuplicatePacketType
		);
	}

	#[test]
	fn unknown_id_fails_to_create() {
		crate::init();
		assert_eq!(create(250).unwrap_err().kind(), ErrorKind::UnknownPacket);
	}

	#[test]
	fn builtin_ids_0_through_8_are_all_registered() {
		crate::init();
		for id in 0..=8u8 {
			assert_eq!(create(id).unwrap().type_id(), id, "id {id} did not round-trip through the registry");
		}
	}

	#[test]
	fn user_ids_start_at_64() {
		assert_eq!(MIN_USER_ID, 64);
	}
}
