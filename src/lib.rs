//! A multithreaded, reliable-plus-unreliable networking engine for real-time games.
//!
//! Generalizes the teacher crate's single connectionless-UDP transport into the two-
//! channel model described by the design notes: a reliable, ordered TCP stream
//! carrying the handshake and framed packets, and an optional unreliable UDP channel
//! negotiated during that handshake. See [`connection::Connection`] for the per-peer
//! state machine, [`server::ServerListener`] for the accept side, and [`packet`] for
//! the wire codec and type registry.

#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod event;
pub mod multiplex;
pub mod packet;
pub mod server;
pub mod socket;
pub mod stats;
pub mod stream;
pub mod time;
pub mod wire;

use std::sync::Once;

pub use connection::{Connection, ConnectionParams, ConnectionState, GameInfo, ProtocolVersion};
pub use error::{Error, ErrorKind};
pub use event::Listener;
pub use packet::Packet;
pub use server::{ConnectionFactory, ServerListener};
pub use stream::Feeder;

static INIT: Once = Once::new();

/// Register the built-in packet types. Idempotent and cheap to call more than once;
/// every entry point that needs the registry populated ([`Connection::connect`],
/// [`server::ServerListener::bind`]) calls this itself, so applications normally
/// never need to call it directly.
pub fn init() {
	INIT.call_once(|| {
		packet::init_builtin();
	});
}
