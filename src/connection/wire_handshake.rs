//! The connection-request/connection-accept handshake wire format.
//!
//! There is no surviving reference source for GNE's actual `ConnectionRequestPacket`/
//! `ConnectionAckPacket` codec (only thin stubs like `ServerConnection.cpp` remain), so
//! the exact byte layout here is this crate's own design: a fixed-width 48-byte
//! connection request body (magic, protocol version, game name, user version, whether
//! an unreliable channel is wanted) followed by a separate 4-byte advertised in-rate,
//! and a fixed 21-byte connection accept/refuse frame (the same 12-byte version header
//! either way, followed by an accept flag, an advertised in-rate, and an unreliable
//! port — unused filler on a refusal). The 8-byte magic header itself is not part of
//! that invented layout: its value is fixed by the wire format this codec implements.

use crate::error::{Error, ErrorKind};
use crate::socket::ReliableChannel;

use super::{read_exact_mapped, GameInfo};

/// Magic header `"GNE\0"` followed by 4 reserved bytes, always written as zero.
const CRP_MAGIC: &[u8; 8] = b"GNE\0\0\0\0\0";
const GAME_NAME_FIELD_LEN: usize = 32;

/// `48` bytes: see the module doc for the field layout. The advertised in-rate that
/// follows on the wire is a separate 4-byte write/read, not counted here, since it is
/// produced from a plain `u32` rather than this fixed struct.
const CRP_HEADER_LEN: usize = 8 + 1 + 1 + 2 + GAME_NAME_FIELD_LEN + 2 + 1 + 1;

/// `21` bytes: 12-byte header (magic + version) + 1 flag + 4 rate + 4 port.
const CAP_LEN: usize = 8 + 1 + 1 + 2 + 1 + 4 + 4;

pub(crate) const REFUSE_VERSION: u8 = 1;
pub(crate) const REFUSE_WRONG_GAME: u8 = 2;
pub(crate) const REFUSE_USER_VERSION_MISMATCH: u8 = 3;

/// This crate's own wire-protocol version, independent of the application's
/// [`GameInfo::user_version`]. Bumped whenever the handshake or frame format changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
	pub major: u8,
	pub minor: u8,
	pub build: u16,
}

impl ProtocolVersion {
	pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0, build: 0 };
}

pub(crate) struct CrpPayload {
	pub protocol: ProtocolVersion,
	pub game_name: String,
	pub user_version: u16,
	pub unrel_requested: bool,
	pub advertised_in_rate: u32,
}

pub(crate) struct CapPayload {
	pub protocol: ProtocolVersion,
	pub accept: bool,
	pub refuse_reason: u8,
	pub advertised_in_rate: u32,
	pub unrel_port: i32,
}

fn game_name_field(name: &str) -> [u8; GAME_NAME_FIELD_LEN] {
	let mut field = [0u8; GAME_NAME_FIELD_LEN];
	let bytes = name.as_bytes();
	let copy_len = bytes.len().min(GAME_NAME_FIELD_LEN);
	field[..copy_len].copy_from_slice(&bytes[..copy_len]);
	field
}

pub(crate) fn write_crp(
	channel: &mut dyn ReliableChannel,
	game: &GameInfo,
	advertised_in_rate: u32,
	unrel_requested: bool,
) -> Result<(), Error> {
	let mut buf = Vec::with_capacity(CRP_HEADER_LEN + 4);
	buf.extend_from_slice(CRP_MAGIC);
	buf.push(game.protocol.major);
	buf.push(game.protocol.minor);
	buf.extend_from_slice(&game.protocol.build.to_be_bytes());
	buf.extend_from_slice(&game_name_field(&game.name));
	buf.extend_from_slice(&game.user_version.to_be_bytes());
	buf.push(unrel_requested as u8);
	buf.push(0); // reserved
	debug_assert_eq!(buf.len(), CRP_HEADER_LEN);
	buf.extend_from_slice(&advertised_in_rate.to_be_bytes());
	channel.write_all(&buf).map_err(|e| Error::from_io(ErrorKind::Write, &e))
}

pub(crate) fn read_crp(channel: &mut dyn ReliableChannel) -> Result<CrpPayload, Error> {
	let mut header = [0u8; CRP_HEADER_LEN];
	read_exact_mapped(channel, &mut header, ErrorKind::Read)?;
	if &header[0..8] != CRP_MAGIC {
		return Err(Error::new(ErrorKind::ProtocolViolation));
	}
	let major = header[8];
	let minor = header[9];
	let build = u16::from_be_bytes([header[10], header[11]]);
	let name_bytes = &header[12..12 + GAME_NAME_FIELD_LEN];
	let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
	let game_name = String::from_utf8_lossy(&name_bytes[..name_end]).into_owned();
	let uv_off = 12 + GAME_NAME_FIELD_LEN;
	let user_version = u16::from_be_bytes([header[uv_off], header[uv_off + 1]]);
	let unrel_requested = header[uv_off + 2] != 0;

	let mut rate_buf = [0u8; 4];
	read_exact_mapped(channel, &mut rate_buf, ErrorKind::Read)?;
	let advertised_in_rate = u32::from_be_bytes(rate_buf);

	Ok(CrpPayload {
		protocol: ProtocolVersion { major, minor, build },
		game_name,
		user_version,
		unrel_requested,
		advertised_in_rate,
	})
}

pub(crate) fn write_cap(
	channel: &mut dyn ReliableChannel,
	protocol: &ProtocolVersion,
	accept: bool,
	refuse_reason: u8,
	advertised_in_rate: u32,
	unrel_port: i32,
) -> Result<(), Error> {
	let mut buf = Vec::with_capacity(CAP_LEN);
	buf.extend_from_slice(CRP_MAGIC);
	buf.push(protocol.major);
	buf.push(protocol.minor);
	buf.extend_from_slice(&protocol.build.to_be_bytes());
	buf.push(if accept { 1 } else { refuse_reason });
	buf.extend_from_slice(&advertised_in_rate.to_be_bytes());
	buf.extend_from_slice(&unrel_port.to_be_bytes());
	debug_assert_eq!(buf.len(), CAP_LEN);
	channel.write_all(&buf).map_err(|e| Error::from_io(ErrorKind::Write, &e))
}

pub(crate) fn read_cap(channel: &mut dyn ReliableChannel) -> Result<CapPayload, Error> {
	let mut buf = [0u8; CAP_LEN];
	read_exact_mapped(channel, &mut buf, ErrorKind::Read)?;
	if &buf[0..8] != CRP_MAGIC {
		return Err(Error::new(ErrorKind::ProtocolViolation));
	}
	let major = buf[8];
	let minor = buf[9];
	let build = u16::from_be_bytes([buf[10], buf[11]]);
	let flag = buf[12];
	let advertised_in_rate = u32::from_be_bytes([buf[13], buf[14], buf[15], buf[16]]);
	let unrel_port = i32::from_be_bytes([buf[17], buf[18], buf[19], buf[20]]);
	Ok(CapPayload {
		protocol: ProtocolVersion { major, minor, build },
		accept: flag == 1,
		refuse_reason: if flag == 1 { 0 } else { flag },
		advertised_in_rate,
		unrel_port,
	})
}

/// Turn a refusal frame into the error the client surfaces. A version mismatch is
/// derivable straight from the header; a wrong-game or user-version refusal is read
/// back off the explicit reason byte the server wrote. Any reason byte this crate
/// doesn't recognize (e.g. a newer server refusing for a cause this client predates)
/// still collapses to the generic `ConnectionRefused`.
pub(crate) fn classify_refusal(cap: &CapPayload, our_protocol: &ProtocolVersion) -> Error {
	if cap.protocol.major != our_protocol.major {
		return Error::new(if cap.protocol.major > our_protocol.major {
			ErrorKind::GNETheirVersionHigh
		} else {
			ErrorKind::GNETheirVersionLow
		});
	}
	match cap.refuse_reason {
		// Same major: the server refused specifically because our minor is newer than
		// it supports, so from our side the *peer's* version is the low one.
		REFUSE_VERSION => {
			if cap.protocol.minor < our_protocol.minor {
				Error::new(ErrorKind::GNETheirVersionLow)
			} else {
				Error::new(ErrorKind::GNETheirVersionHigh)
			}
		}
		REFUSE_WRONG_GAME => Error::new(ErrorKind::WrongGame),
		REFUSE_USER_VERSION_MISMATCH => Error::new(ErrorKind::UserVersionMismatch),
		_ => Error::new(ErrorKind::ConnectionRefused),
	}
}

/// The rate actually in force after negotiation: the smaller of what we asked to send
/// at and what the peer advertised it can accept, with `0` meaning unlimited on either
/// side (so the other side's non-zero figure wins).
pub(crate) fn effective_rate(requested: u64, peer_advertised_in_rate: u32) -> u64 {
	match (requested, peer_advertised_in_rate as u64) {
		(0, peer) => peer,
		(mine, 0) => mine,
		(mine, peer) => mine.min(peer),
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::io;
	use std::net::SocketAddr;
	use std::time::Duration;

	struct LoopbackChannel {
		inbox: Vec<u8>,
		outbox: Vec<u8>,
		read_pos: usize,
	}

	impl LoopbackChannel {
		fn new() -> Self {
			Self { inbox: Vec::new(), outbox: Vec::new(), read_pos: 0 }
		}
	}

	impl ReliableChannel for LoopbackChannel {
		fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
			let available = &self.inbox[self.read_pos..];
			let n = available.len().min(buf.len());
			buf[..n].copy_from_slice(&available[..n]);
			self.read_pos += n;
			Ok(n)
		}
		fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
			self.outbox.extend_from_slice(buf);
			Ok(())
		}
		fn peek(&self, _buf: &mut [u8]) -> io::Result<usize> {
			Ok(0)
		}
		fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
			Ok(())
		}
		fn peer_addr(&self) -> io::Result<SocketAddr> {
			Ok("127.0.0.1:0".parse().unwrap())
		}
		fn try_clone(&self) -> io::Result<Box<dyn ReliableChannel>> {
			unimplemented!()
		}
		fn shutdown(&mut self) {}
	}

	#[test]
	fn crp_round_trips_fields() {
		let game = GameInfo::new("demo-game", 7);
		let mut channel = LoopbackChannel::new();
		write_crp(&mut channel, &game, 4096, true).unwrap();
		channel.inbox = std::mem::take(&mut channel.outbox);
		let parsed = read_crp(&mut channel).unwrap();
		assert_eq!(parsed.game_name, "demo-game");
		assert_eq!(parsed.user_version, 7);
		assert!(parsed.unrel_requested);
		assert_eq!(parsed.advertised_in_rate, 4096);
		assert_eq!(parsed.protocol, ProtocolVersion::CURRENT);
	}

	#[test]
	fn cap_round_trips_accept() {
		let mut channel = LoopbackChannel::new();
		write_cap(&mut channel, &ProtocolVersion::CURRENT, true, 0, 2048, 9999).unwrap();
		channel.inbox = std::mem::take(&mut channel.outbox);
		let parsed = read_cap(&mut channel).unwrap();
		assert!(parsed.accept);
		assert_eq!(parsed.advertised_in_rate, 2048);
		assert_eq!(parsed.unrel_port, 9999);
	}

	#[test]
	fn cap_round_trips_refusal_reason() {
		let mut channel = LoopbackChannel::new();
		write_cap(&mut channel, &ProtocolVersion::CURRENT, false, REFUSE_WRONG_GAME, 0, -1).unwrap();
		channel.inbox = std::mem::take(&mut channel.outbox);
		let parsed = read_cap(&mut channel).unwrap();
		assert!(!parsed.accept);
		assert_eq!(parsed.refuse_reason, REFUSE_WRONG_GAME);
		let error = classify_refusal(&parsed, &ProtocolVersion::CURRENT);
		assert_eq!(error.kind(), ErrorKind::WrongGame);
	}

	#[test]
	fn classify_refusal_reports_the_peer_as_behind_when_we_are_newer() {
		// Client at minor 5 talks to a server stuck at minor 3: the server is the one
		// refusing, but from the client's point of view the *peer* is the low side.
		let ours = ProtocolVersion { major: 1, minor: 5, build: 0 };
		let theirs = ProtocolVersion { major: 1, minor: 3, build: 0 };
		let cap = CapPayload {
			protocol: theirs,
			accept: false,
			refuse_reason: REFUSE_VERSION,
			advertised_in_rate: 0,
			unrel_port: -1,
		};
		assert_eq!(classify_refusal(&cap, &ours).kind(), ErrorKind::GNETheirVersionLow);
	}

	#[test]
	fn classify_refusal_reports_the_peer_as_ahead_when_we_are_older() {
		let ours = ProtocolVersion { major: 1, minor: 0, build: 0 };
		let theirs = ProtocolVersion { major: 1, minor: 2, build: 0 };
		let cap = CapPayload {
			protocol: theirs,
			accept: false,
			refuse_reason: REFUSE_VERSION,
			advertised_in_rate: 0,
			unrel_port: -1,
		};
		assert_eq!(classify_refusal(&cap, &ours).kind(), ErrorKind::GNETheirVersionHigh);
	}

	#[test]
	fn effective_rate_picks_smaller_nonzero_side() {
		assert_eq!(effective_rate(0, 0), 0);
		assert_eq!(effective_rate(0, 500), 500);
		assert_eq!(effective_rate(1000, 0), 1000);
		assert_eq!(effective_rate(1000, 500), 500);
	}
}
