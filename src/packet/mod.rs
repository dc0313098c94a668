//! Tagged packet types and the process-wide registry that parses them off the wire.
//!
//! Generalizes the teacher crate's deep-inheritance-free approach to messages
//! (`Parcel: ByteSerialize`) into the trait/registry split described for this engine:
//! a `Packet` trait exposing the four contract methods, and a `u8 -> factory` map built
//! once at [`crate::init`] time (see `registry`).

mod registry;
mod types;

use crate::error::{Error, ErrorKind};
use crate::wire::RawPacket;
use std::any::Any;
use std::fmt::Debug;

pub use registry::{register, MIN_USER_ID};
pub use types::{
	ChannelPacket, CustomPacket, ExitPacket, GenericPacket, ObjectCreationPacket,
	ObjectDeathPacket, ObjectUpdatePacket, PingPacket, RateAdjustPacket,
};

pub(crate) use registry::init_builtin;

/// Reserved type id of [`ExitPacket`], which must be the last packet sent on the
/// reliable channel of a connection.
pub const EXIT_PACKET_ID: u8 = 0;

/// A tagged, immutable message exchanged between peers.
///
/// Every concrete packet type registers a unique [`type_id`](Packet::type_id) and a
/// zero-argument factory with [`register`] (built-in types do so at [`crate::init`]
/// time); applications may register further ids at or above [`MIN_USER_ID`].
pub trait Packet: Debug + Send {
	/// The 1-byte type id this packet is registered under.
	fn type_id(&self) -> u8;

	/// Maximum serialized payload size in bytes, excluding the 1-byte id and 4-byte
	/// timestamp that the frame format adds around every packet.
	fn size(&self) -> usize;

	/// Serialize the payload (not the id or timestamp) into `raw`.
	fn write(&self, raw: &mut RawPacket) -> Result<(), Error>;

	/// Deserialize the payload (not the id or timestamp) from `raw`.
	fn read(&mut self, raw: &mut RawPacket) -> Result<(), Error>;

	/// Produce a deep copy of this packet.
	fn clone_box(&self) -> Box<dyn Packet>;

	/// Support downcasting to a concrete type, used by the connection's receive path to
	/// recognize control packets (ping, rate adjust) without a dedicated enum tag.
	fn as_any(&self) -> &dyn Any;
}

impl Clone for Box<dyn Packet> {
	fn clone(&self) -> Self {
		self.clone_box()
	}
}

/// A packet paired with the 32-bit wire timestamp it carried.
#[derive(Debug)]
pub struct Received {
	pub packet: Box<dyn Packet>,
	pub timestamp: u32,
}

/// Serialize `packet`'s 1-byte id, its 4-byte timestamp, then its payload into `raw`.
///
/// Fails with [`ErrorKind::PacketTooBig`] if the packet's declared
/// [`size`](Packet::size) would not fit the remaining buffer capacity.
pub fn serialize(packet: &dyn Packet, timestamp: u32, raw: &mut RawPacket) -> Result<(), Error> {
	if packet.size() > raw.remaining_capacity().saturating_sub(5) {
		return Err(Error::new(ErrorKind::PacketTooBig));
	}
	raw.write(&packet.type_id())?;
	raw.write(&timestamp)?;
	packet.write(raw)
}

/// Read one packet's id, timestamp and payload off `raw`.
///
/// On [`ErrorKind::UnknownPacket`] the caller is expected to discard the remainder of
/// the current frame, since there is no way to know the unknown packet's length.
pub fn parse_next(raw: &mut RawPacket) -> Result<Received, Error> {
	let type_id: u8 = raw.read()?;
	let timestamp: u32 = raw.read()?;
	let mut packet = registry::create(type_id)?;
	packet.read(raw)?;
	Ok(Received { packet, timestamp })
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn serialize_then_parse_round_trips() {
		crate::init();
		let packet = CustomPacket::new(vec![0xDE, 0xAD, 0xBE, 0xEF]);
		let mut raw = RawPacket::new();
		serialize(&packet, 1234, &mut raw).unwrap();
		raw.reset();
		let received = parse_next(&mut raw).unwrap();
		assert_eq!(received.timestamp, 1234);
		assert_eq!(received.packet.type_id(), packet.type_id());
	}

	#[test]
	fn unregistered_id_is_unknown_packet() {
		crate::init();
		let mut raw = RawPacket::new();
		raw.write(&250u8).unwrap();
		raw.write(&0u32).unwrap();
		raw.reset();
		assert_eq!(parse_next(&mut raw).unwrap_err().kind(), ErrorKind::UnknownPacket);
	}
}
