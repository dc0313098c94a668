//! Built-in packet bodies.
//!
//! Re-expresses `gnelib`'s `WrapperPacket`-derived types (`ChannelPacket`,
//! `ObjectCreationPacket`, `ObjectUpdatePacket`, `ObjectDeathPacket`) as plain data
//! carrying one nested packet's already-serialized bytes, rather than reconstructing
//! the virtual `WrapperPacket` base class.

use super::Packet;
use crate::error::Error;
use crate::wire::{Bytes, RawPacket};
use std::any::Any;

/// Type id 0. No payload; signals graceful disconnect and must be the last packet sent
/// on the reliable channel of a connection.
#[derive(Debug, Clone, Default)]
pub struct ExitPacket;

impl ExitPacket {
	pub fn new() -> Self {
		Self
	}
}

impl Packet for ExitPacket {
	fn type_id(&self) -> u8 {
		0
	}
	fn size(&self) -> usize {
		0
	}
	fn write(&self, _raw: &mut RawPacket) -> Result<(), Error> {
		Ok(())
	}
	fn read(&mut self, _raw: &mut RawPacket) -> Result<(), Error> {
		Ok(())
	}
	fn clone_box(&self) -> Box<dyn Packet> {
		Box::new(self.clone())
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
}

/// Type id 1. The base `Packet` class in the original library could be instantiated
/// directly (no payload beyond the implicit timestamp) for applications that just need
/// a unique, recognizable marker with no fields of its own; this is that packet, kept
/// distinct from [`ExitPacket`] so id 0 stays reserved for the disconnect signal.
#[derive(Debug, Clone, Default)]
pub struct GenericPacket;

impl GenericPacket {
	pub fn new() -> Self {
		Self
	}
}

impl Packet for GenericPacket {
	fn type_id(&self) -> u8 {
		1
	}
	fn size(&self) -> usize {
		0
	}
	fn write(&self, _raw: &mut RawPacket) -> Result<(), Error> {
		Ok(())
	}
	fn read(&mut self, _raw: &mut RawPacket) -> Result<(), Error> {
		Ok(())
	}
	fn clone_box(&self) -> Box<dyn Packet> {
		Box::new(self.clone())
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
}

/// Type id 2. A latency probe: `request` marks an outgoing ping awaiting a reply,
/// `ping_time` carries the originator's clock reading to be echoed back unchanged.
///
/// The connection's receive path (see `crate::connection::Connection::handle_received`)
/// auto-answers inbound requests by flipping `request` to `false` and re-sending before
/// the ping ever reaches the application's inbound queue; ping *replies* are delivered
/// to the application like any other packet so it can compute round-trip time.
#[derive(Debug, Clone, Default)]
pub struct PingPacket {
	pub request: bool,
	pub ping_time: i32,
}

impl PingPacket {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn request(ping_time: i32) -> Self {
		Self { request: true, ping_time }
	}
}

impl Packet for PingPacket {
	fn type_id(&self) -> u8 {
		2
	}
	fn size(&self) -> usize {
		1 + 4
	}
	fn write(&self, raw: &mut RawPacket) -> Result<(), Error> {
		raw.write(&self.request)?;
		raw.write(&self.ping_time)
	}
	fn read(&mut self, raw: &mut RawPacket) -> Result<(), Error> {
		self.request = raw.read()?;
		self.ping_time = raw.read()?;
		Ok(())
	}
	fn clone_box(&self) -> Box<dyn Packet> {
		Box::new(self.clone())
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
}

/// Type id 3. Requests that the peer change the rate it sends to us.
///
/// `new_rate` follows [`crate::stream::TokenBucket::set_rate`]'s sentinel convention:
/// `-1` leaves the current rate unchanged, `0` lifts the limit, any other value (bytes
/// per second) becomes the new cap.
#[derive(Debug, Clone, Default)]
pub struct RateAdjustPacket {
	pub new_rate: i32,
}

impl RateAdjustPacket {
	pub fn new() -> Self {
		Self::default()
	}
}

impl Packet for RateAdjustPacket {
	fn type_id(&self) -> u8 {
		3
	}
	fn size(&self) -> usize {
		4
	}
	fn write(&self, raw: &mut RawPacket) -> Result<(), Error> {
		raw.write(&self.new_rate)
	}
	fn read(&mut self, raw: &mut RawPacket) -> Result<(), Error> {
		self.new_rate = raw.read()?;
		Ok(())
	}
	fn clone_box(&self) -> Box<dyn Packet> {
		Box::new(self.clone())
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
}

/// Type id 4. An opaque, length-prefixed byte payload — the escape hatch for
/// applications that would rather hand-roll their own wire format than register a
/// dedicated packet type.
#[derive(Debug, Clone, Default)]
pub struct CustomPacket {
	pub payload: Bytes,
}

impl CustomPacket {
	pub fn new(payload: Vec<u8>) -> Self {
		Self { payload: Bytes(payload) }
	}
}

impl Packet for CustomPacket {
	fn type_id(&self) -> u8 {
		4
	}
	fn size(&self) -> usize {
		self.payload.0.len() + 2
	}
	fn write(&self, raw: &mut RawPacket) -> Result<(), Error> {
		raw.write(&self.payload)
	}
	fn read(&mut self, raw: &mut RawPacket) -> Result<(), Error> {
		self.payload = raw.read()?;
		Ok(())
	}
	fn clone_box(&self) -> Box<dyn Packet> {
		Box::new(self.clone())
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
}

fn write_nested(raw: &mut RawPacket, nested: &Option<Box<dyn Packet>>) -> Result<(), Error> {
	match nested {
		Some(inner) => {
			raw.write(&true)?;
			super::serialize(inner.as_ref(), 0, raw)
		}
		None => raw.write(&false),
	}
}

fn read_nested(raw: &mut RawPacket) -> Result<Option<Box<dyn Packet>>, Error> {
	let present: bool = raw.read()?;
	if present {
		Ok(Some(super::parse_next(raw)?.packet))
	} else {
		Ok(None)
	}
}

fn nested_size(nested: &Option<Box<dyn Packet>>) -> usize {
	1 + nested.as_ref().map_or(0, |inner| inner.size() + 5)
}

/// Type id 5. Multiplexes several logical sub-channels over one connection by tagging
/// a wrapped inner packet with a `channel` number and the `from` participant that sent
/// it (mirrors `gnelib::ChannelPacket`, without its `WrapperPacket` base class).
#[derive(Debug, Default)]
pub struct ChannelPacket {
	pub channel: u8,
	pub from: u8,
	pub inner: Option<Box<dyn Packet>>,
}

impl ChannelPacket {
	pub fn new(channel: u8, from: u8, inner: Option<Box<dyn Packet>>) -> Self {
		Self { channel, from, inner }
	}
}

impl Clone for ChannelPacket {
	fn clone(&self) -> Self {
		Self { channel: self.channel, from: self.from, inner: self.inner.clone() }
	}
}

impl Packet for ChannelPacket {
	fn type_id(&self) -> u8 {
		5
	}
	fn size(&self) -> usize {
		2 + nested_size(&self.inner)
	}
	fn write(&self, raw: &mut RawPacket) -> Result<(), Error> {
		raw.write(&self.channel)?;
		raw.write(&self.from)?;
		write_nested(raw, &self.inner)
	}
	fn read(&mut self, raw: &mut RawPacket) -> Result<(), Error> {
		self.channel = raw.read()?;
		self.from = raw.read()?;
		self.inner = read_nested(raw)?;
		Ok(())
	}
	fn clone_box(&self) -> Box<dyn Packet> {
		Box::new(self.clone())
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
}

/// Type id 6. Announces a new replicated object, carrying its id and the inner packet
/// describing its initial state (mirrors `gnelib::ObjectCreationPacket`).
#[derive(Debug, Default)]
pub struct ObjectCreationPacket {
	pub object_id: u32,
	pub inner: Option<Box<dyn Packet>>,
}

impl ObjectCreationPacket {
	pub fn new(object_id: u32, inner: Option<Box<dyn Packet>>) -> Self {
		Self { object_id, inner }
	}
}

impl Clone for ObjectCreationPacket {
	fn clone(&self) -> Self {
		Self { object_id: self.object_id, inner: self.inner.clone() }
	}
}

impl Packet for ObjectCreationPacket {
	fn type_id(&self) -> u8 {
		6
	}
	fn size(&self) -> usize {
		4 + nested_size(&self.inner)
	}
	fn write(&self, raw: &mut RawPacket) -> Result<(), Error> {
		raw.write(&self.object_id)?;
		write_nested(raw, &self.inner)
	}
	fn read(&mut self, raw: &mut RawPacket) -> Result<(), Error> {
		self.object_id = raw.read()?;
		self.inner = read_nested(raw)?;
		Ok(())
	}
	fn clone_box(&self) -> Box<dyn Packet> {
		Box::new(self.clone())
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
}

/// Type id 7. Updates the state of a previously created replicated object (mirrors
/// `gnelib::ObjectUpdatePacket`).
#[derive(Debug, Default)]
pub struct ObjectUpdatePacket {
	pub object_id: u32,
	pub inner: Option<Box<dyn Packet>>,
}

impl ObjectUpdatePacket {
	pub fn new(object_id: u32, inner: Option<Box<dyn Packet>>) -> Self {
		Self { object_id, inner }
	}
}

impl Clone for ObjectUpdatePacket {
	fn clone(&self) -> Self {
		Self { object_id: self.object_id, inner: self.inner.clone() }
	}
}

impl Packet for ObjectUpdatePacket {
	fn type_id(&self) -> u8 {
		7
	}
	fn size(&self) -> usize {
		4 + nested_size(&self.inner)
	}
	fn write(&self, raw: &mut RawPacket) -> Result<(), Error> {
		raw.write(&self.object_id)?;
		write_nested(raw, &self.inner)
	}
	fn read(&mut self, raw: &mut RawPacket) -> Result<(), Error> {
		self.object_id = raw.read()?;
		self.inner = read_nested(raw)?;
		Ok(())
	}
	fn clone_box(&self) -> Box<dyn Packet> {
		Box::new(self.clone())
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
}

/// Type id 8. Announces that a replicated object is being removed. The original
/// allows a null data pointer here, so the wrapped packet is optional (mirrors
/// `gnelib::ObjectDeathPacket`).
#[derive(Debug, Default)]
pub struct ObjectDeathPacket {
	pub object_id: u32,
	pub inner: Option<Box<dyn Packet>>,
}

impl ObjectDeathPacket {
	pub fn new(object_id: u32, inner: Option<Box<dyn Packet>>) -> Self {
		Self { object_id, inner }
	}
}

impl Clone for ObjectDeathPacket {
	fn clone(&self) -> Self {
		Self { object_id: self.object_id, inner: self.inner.clone() }
	}
}

impl Packet for ObjectDeathPacket {
	fn type_id(&self) -> u8 {
		8
	}
	fn size(&self) -> usize {
		4 + nested_size(&self.inner)
	}
	fn write(&self, raw: &mut RawPacket) -> Result<(), Error> {
		raw.write(&self.object_id)?;
		write_nested(raw, &self.inner)
	}
	fn read(&mut self, raw: &mut RawPacket) -> Result<(), Error> {
		self.object_id = raw.read()?;
		self.inner = read_nested(raw)?;
		Ok(())
	}
	fn clone_box(&self) -> Box<dyn Packet> {
		Box::new(self.clone())
	}
	fn as_any(&self) -> &dyn Any {
		self
	}
}
