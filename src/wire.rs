//! Endian-normalized primitive codec into a fixed-capacity byte buffer.
//!
//! Mirrors the role of the teacher crate's `ByteSerialize` trait (see the historical
//! `byte.rs`), but targets a single concrete, fixed-size buffer written in network
//! byte order, since the wire protocol here is a byte-exact handshake and frame format
//! rather than a generic serialization scheme.

use crate::error::{Error, ErrorKind};

/// Default (and, for this crate, only) capacity of a [`RawPacket`] buffer.
pub const RAW_PACKET_CAPACITY: usize = 500;

/// A fixed-capacity byte buffer with a cursor, used to build outbound frames and to
/// parse inbound ones.
#[derive(Clone)]
pub struct RawPacket {
	buffer: [u8; RAW_PACKET_CAPACITY],
	position: usize,
	len: usize,
}

impl RawPacket {
	/// An empty buffer ready for writing.
	pub fn new() -> Self {
		Self { buffer: [0; RAW_PACKET_CAPACITY], position: 0, len: 0 }
	}

	/// A buffer pre-loaded with `bytes`, ready for reading.
	pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
		if bytes.len() > RAW_PACKET_CAPACITY {
			return Err(Error::new(ErrorKind::BufferOverflow));
		}
		let mut raw = Self::new();
		raw.buffer[..bytes.len()].copy_from_slice(bytes);
		raw.len = bytes.len();
		Ok(raw)
	}

	/// Move the cursor back to the start of the buffer without discarding its contents.
	#[inline]
	pub fn reset(&mut self) {
		self.position = 0;
	}

	/// Move the cursor to the start and forget any previously written/read contents.
	#[inline]
	pub fn clear(&mut self) {
		self.position = 0;
		self.len = 0;
	}

	/// Current cursor offset.
	#[inline]
	pub fn position(&self) -> usize {
		self.position
	}

	/// Number of valid bytes currently held (the write high-water mark, or the length
	/// passed to [`from_bytes`](Self::from_bytes)).
	#[inline]
	pub fn len(&self) -> usize {
		self.len
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Bytes of capacity still available for writing.
	#[inline]
	pub fn remaining_capacity(&self) -> usize {
		RAW_PACKET_CAPACITY - self.position
	}

	/// Bytes still available to read before hitting `len`.
	#[inline]
	pub fn remaining_readable(&self) -> usize {
		self.len - self.position
	}

	/// Borrow the valid contents of the buffer (`0..len`), typically for handing to a
	/// socket write.
	#[inline]
	pub fn data(&self) -> &[u8] {
		&self.buffer[..self.len]
	}

	fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
		if bytes.len() > self.remaining_capacity() {
			return Err(Error::new(ErrorKind::BufferOverflow));
		}
		let end = self.position + bytes.len();
		self.buffer[self.position..end].copy_from_slice(bytes);
		self.position = end;
		if self.position > self.len {
			self.len = self.position;
		}
		Ok(())
	}

	fn read_bytes(&mut self, count: usize) -> Result<&[u8], Error> {
		if count > self.remaining_readable() {
			return Err(Error::new(ErrorKind::BufferUnderflow));
		}
		let start = self.position;
		self.position += count;
		Ok(&self.buffer[start..self.position])
	}

	/// Write a value implementing [`WireWrite`].
	#[inline]
	pub fn write<T: WireWrite>(&mut self, value: &T) -> Result<(), Error> {
		value.write_to(self)
	}

	/// Read a value implementing [`WireRead`].
	#[inline]
	pub fn read<T: WireRead>(&mut self) -> Result<T, Error> {
		T::read_from(self)
	}
}

impl Default for RawPacket {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for RawPacket {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RawPacket")
			.field("position", &self.position)
			.field("len", &self.len)
			.finish()
	}
}

/// A value that can be written in network byte order into a [`RawPacket`].
pub trait WireWrite {
	/// Number of bytes this particular value serializes to.
	fn wire_size(&self) -> usize;
	fn write_to(&self, raw: &mut RawPacket) -> Result<(), Error>;
}

/// A value that can be parsed in network byte order out of a [`RawPacket`].
pub trait WireRead: Sized {
	fn read_from(raw: &mut RawPacket) -> Result<Self, Error>;
}

macro_rules! impl_wire_numeric {
	($type:ty) => {
		impl WireWrite for $type {
			#[inline]
			fn wire_size(&self) -> usize {
				std::mem::size_of::<Self>()
			}
			#[inline]
			fn write_to(&self, raw: &mut RawPacket) -> Result<(), Error> {
				raw.write_bytes(&self.to_be_bytes())
			}
		}
		impl WireRead for $type {
			#[inline]
			fn read_from(raw: &mut RawPacket) -> Result<Self, Error> {
				let bytes = raw.read_bytes(std::mem::size_of::<Self>())?;
				let mut array = [0u8; std::mem::size_of::<Self>()];
				array.copy_from_slice(bytes);
				Ok(Self::from_be_bytes(array))
			}
		}
	};
	($type:ty, $($rest:ty),+) => {
		impl_wire_numeric!($type);
		impl_wire_numeric!($($rest),+);
	};
}

impl_wire_numeric!(i8, u8, i16, u16, i32, u32, i64, u64);

impl WireWrite for f32 {
	#[inline]
	fn wire_size(&self) -> usize {
		4
	}
	#[inline]
	fn write_to(&self, raw: &mut RawPacket) -> Result<(), Error> {
		raw.write_bytes(&self.to_be_bytes())
	}
}

impl WireRead for f32 {
	#[inline]
	fn read_from(raw: &mut RawPacket) -> Result<Self, Error> {
		let bytes = raw.read_bytes(4)?;
		let mut array = [0u8; 4];
		array.copy_from_slice(bytes);
		Ok(Self::from_be_bytes(array))
	}
}

impl WireWrite for f64 {
	#[inline]
	fn wire_size(&self) -> usize {
		8
	}
	#[inline]
	fn write_to(&self, raw: &mut RawPacket) -> Result<(), Error> {
		raw.write_bytes(&self.to_be_bytes())
	}
}

impl WireRead for f64 {
	#[inline]
	fn read_from(raw: &mut RawPacket) -> Result<Self, Error> {
		let bytes = raw.read_bytes(8)?;
		let mut array = [0u8; 8];
		array.copy_from_slice(bytes);
		Ok(Self::from_be_bytes(array))
	}
}

impl WireWrite for bool {
	#[inline]
	fn wire_size(&self) -> usize {
		1
	}
	#[inline]
	fn write_to(&self, raw: &mut RawPacket) -> Result<(), Error> {
		raw.write_bytes(&[*self as u8])
	}
}

impl WireRead for bool {
	#[inline]
	fn read_from(raw: &mut RawPacket) -> Result<Self, Error> {
		Ok(raw.read_bytes(1)?[0] != 0)
	}
}

/// A length-prefixed, NUL-free UTF-8 string.
impl WireWrite for str {
	#[inline]
	fn wire_size(&self) -> usize {
		2 + self.len()
	}
	fn write_to(&self, raw: &mut RawPacket) -> Result<(), Error> {
		debug_assert!(!self.as_bytes().contains(&0), "wire strings may not contain NUL");
		(self.len() as u16).write_to(raw)?;
		raw.write_bytes(self.as_bytes())
	}
}

impl WireWrite for String {
	#[inline]
	fn wire_size(&self) -> usize {
		self.as_str().wire_size()
	}
	#[inline]
	fn write_to(&self, raw: &mut RawPacket) -> Result<(), Error> {
		self.as_str().write_to(raw)
	}
}

impl WireRead for String {
	fn read_from(raw: &mut RawPacket) -> Result<Self, Error> {
		let len: u16 = raw.read()?;
		let bytes = raw.read_bytes(len as usize)?;
		String::from_utf8(bytes.to_vec()).map_err(|_| Error::new(ErrorKind::ProtocolViolation))
	}
}

/// Raw, length-prefixed byte payload, used by packets that carry opaque application data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bytes(pub Vec<u8>);

impl WireWrite for Bytes {
	#[inline]
	fn wire_size(&self) -> usize {
		2 + self.0.len()
	}
	fn write_to(&self, raw: &mut RawPacket) -> Result<(), Error> {
		(self.0.len() as u16).write_to(raw)?;
		raw.write_bytes(&self.0)
	}
}

impl WireRead for Bytes {
	fn read_from(raw: &mut RawPacket) -> Result<Self, Error> {
		let len: u16 = raw.read()?;
		Ok(Bytes(raw.read_bytes(len as usize)?.to_vec()))
	}
}
