//! Error taxonomy shared by every layer of the engine.

use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::io;

/// The kind of an error raised anywhere in the engine.
///
/// The numeric order of variants carries no meaning; only the set is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	NoError,
	ProtocolViolation,
	GNETheirVersionLow,
	GNETheirVersionHigh,
	UserVersionMismatch,
	WrongGame,
	CouldNotOpenSocket,
	ConnectionTimeOut,
	ConnectionRefused,
	ConnectionDropped,
	SyncConnectionReleased,
	Read,
	Write,
	UnknownPacket,
	PacketTypeMismatch,
	DuplicatePacketType,
	PacketTooBig,
	BufferOverflow,
	BufferUnderflow,
	OtherGNELevelError,
	OtherLowLevelError,
}

impl ErrorKind {
	fn message(self) -> &'static str {
		match self {
			Self::NoError => "no error",
			Self::ProtocolViolation => "the remote end did not follow the protocol",
			Self::GNETheirVersionLow => "the remote end uses an earlier protocol version",
			Self::GNETheirVersionHigh => "the remote end uses a later protocol version",
			Self::UserVersionMismatch => "the user protocol version numbers do not match",
			Self::WrongGame => "the remote end is running a different game",
			Self::CouldNotOpenSocket => "could not open a network socket",
			Self::ConnectionTimeOut => "connection attempt timed out",
			Self::ConnectionRefused => "the remote end refused the connection",
			Self::ConnectionDropped => "the remote end disconnected without warning",
			Self::SyncConnectionReleased => "the operation was canceled because the connection was released",
			Self::Read => "network error while reading from the connection",
			Self::Write => "network error while writing to the connection",
			Self::UnknownPacket => "unknown packet type encountered, possible data loss",
			Self::PacketTypeMismatch => "packet type received does not match what was expected",
			Self::DuplicatePacketType => "a packet type is already registered under that id",
			Self::PacketTooBig => "packet does not fit in a single frame",
			Self::BufferOverflow => "write would overflow the buffer",
			Self::BufferUnderflow => "read would underflow the buffer",
			Self::OtherGNELevelError => "other engine-level error",
			Self::OtherLowLevelError => "other low-level network error",
		}
	}
}

/// An error value carrying an [`ErrorKind`] plus optional low-level diagnostics.
///
/// Errors are values, never used for control flow beyond the `Result` they are returned in.
#[derive(Debug, Clone)]
pub struct Error {
	kind: ErrorKind,
	sys_error: Option<i32>,
	net_error: Option<io::ErrorKind>,
}

impl Error {
	/// Construct an error carrying only a kind, no low-level diagnostics.
	pub fn new(kind: ErrorKind) -> Self {
		Self { kind, sys_error: None, net_error: None }
	}

	/// Construct an error from a low-level [`std::io::Error`], mapping common kinds.
	pub fn from_io(kind: ErrorKind, io_err: &io::Error) -> Self {
		Self {
			kind,
			sys_error: io_err.raw_os_error(),
			net_error: Some(io_err.kind()),
		}
	}

	pub fn kind(&self) -> ErrorKind {
		self.kind
	}

	pub fn sys_error(&self) -> Option<i32> {
		self.sys_error
	}

	pub fn net_error(&self) -> Option<io::ErrorKind> {
		self.net_error
	}

	/// Whether this error represents the absence of an error.
	pub fn is_ok(&self) -> bool {
		self.kind == ErrorKind::NoError
	}
}

impl Display for Error {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.kind.message())?;
		if let Some(net_error) = self.net_error {
			write!(f, " (network error: {:?})", net_error)?;
		}
		if let Some(sys_error) = self.sys_error {
			write!(f, " (system error {})", sys_error)?;
		}
		Ok(())
	}
}

impl StdError for Error {}

impl From<ErrorKind> for Error {
	fn from(kind: ErrorKind) -> Self {
		Self::new(kind)
	}
}

impl PartialEq for Error {
	fn eq(&self, rhs: &Self) -> bool {
		self.kind == rhs.kind
	}
}

impl PartialEq<ErrorKind> for Error {
	fn eq(&self, rhs: &ErrorKind) -> bool {
		self.kind == *rhs
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn display_includes_low_level_diagnostics() {
		let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
		let err = Error::from_io(ErrorKind::ConnectionDropped, &io_err);
		let rendered = err.to_string();
		assert!(rendered.starts_with("the remote end disconnected without warning"));
		assert!(rendered.contains("network error"));
	}

	#[test]
	fn equality_ignores_diagnostics() {
		let a = Error::new(ErrorKind::Read);
		let io_err = io::Error::new(io::ErrorKind::Other, "x");
		let b = Error::from_io(ErrorKind::Read, &io_err);
		assert_eq!(a, b);
	}
}
