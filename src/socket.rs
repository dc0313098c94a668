//! Abstract transport traits and their `std::net` backing implementations.
//!
//! Generalizes the teacher crate's `Endpoint`/`Transmit` split (historical
//! `endpoint.rs`) from a single UDP-with-acks socket into the two distinct channels
//! this protocol layers on top of: a reliable, ordered stream (TCP) and a best-effort
//! datagram channel (UDP). Only [`StdTcpChannel`] and [`StdUdpChannel`] ship in this
//! crate; the traits exist so tests (and, in principle, other transports) can swap in
//! a substitute without touching the connection state machine.

use std::io;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

/// The reliable, ordered half of a connection (carries the handshake and the
/// reliable-channel outbound frames).
pub trait ReliableChannel: Send {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
	fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
	/// Non-blocking, non-consuming check for pending bytes, used by the readiness
	/// multiplexer. Returns `Ok(0)` (never `WouldBlock`) when nothing is available.
	fn peek(&self, buf: &mut [u8]) -> io::Result<usize>;
	fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
	fn peer_addr(&self) -> io::Result<SocketAddr>;
	fn try_clone(&self) -> io::Result<Box<dyn ReliableChannel>>;
	/// Best-effort shutdown of both halves; errors are not actionable and are ignored
	/// by callers.
	fn shutdown(&mut self);
}

/// The best-effort, unordered half of a connection (carries unreliable packets once
/// the handshake has negotiated a remote UDP port).
pub trait UnreliableChannel: Send + Sync {
	fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
	fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
	fn local_addr(&self) -> io::Result<SocketAddr>;
	fn try_clone(&self) -> io::Result<Box<dyn UnreliableChannel>>;
	/// Restrict this socket to one peer, so that on platforms where several sockets
	/// share a local port (the server hands every accepted connection its own clone of
	/// the listening datagram socket) the kernel routes each peer's datagrams to its
	/// own connected clone instead of an arbitrary one.
	fn connect(&self, addr: SocketAddr) -> io::Result<()>;
}

/// [`ReliableChannel`] backed by [`std::net::TcpStream`].
pub struct StdTcpChannel(TcpStream);

impl StdTcpChannel {
	pub fn new(stream: TcpStream) -> Self {
		stream.set_nodelay(true).ok();
		Self(stream)
	}

	pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
		let stream = TcpStream::connect_timeout(&addr, timeout)?;
		Ok(Self::new(stream))
	}
}

impl ReliableChannel for StdTcpChannel {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		use std::io::Read;
		self.0.read(buf)
	}

	fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
		use std::io::Write;
		self.0.write_all(buf)
	}

	fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
		match self.0.peek(buf) {
			Ok(n) => Ok(n),
			Err(err) if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut => Ok(0),
			Err(err) => Err(err),
		}
	}

	fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
		self.0.set_read_timeout(timeout)
	}

	fn peer_addr(&self) -> io::Result<SocketAddr> {
		self.0.peer_addr()
	}

	fn try_clone(&self) -> io::Result<Box<dyn ReliableChannel>> {
		Ok(Box::new(StdTcpChannel(self.0.try_clone()?)))
	}

	fn shutdown(&mut self) {
		let _ = self.0.shutdown(std::net::Shutdown::Both);
	}
}

/// [`UnreliableChannel`] backed by [`std::net::UdpSocket`].
pub struct StdUdpChannel(UdpSocket);

impl StdUdpChannel {
	pub fn new(socket: UdpSocket) -> Self {
		Self(socket)
	}

	pub fn bind(addr: SocketAddr) -> io::Result<Self> {
		let socket = UdpSocket::bind(addr)?;
		// Non-blocking so per-connection reader loops can poll a `ShutdownFlag` instead
		// of blocking forever on a peer that never sends anything.
		socket.set_nonblocking(true)?;
		Ok(Self(socket))
	}
}

impl UnreliableChannel for StdUdpChannel {
	fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
		self.0.send_to(buf, addr)
	}

	fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
		self.0.recv_from(buf)
	}

	fn local_addr(&self) -> io::Result<SocketAddr> {
		self.0.local_addr()
	}

	fn try_clone(&self) -> io::Result<Box<dyn UnreliableChannel>> {
		Ok(Box::new(StdUdpChannel(self.0.try_clone()?)))
	}

	fn connect(&self, addr: SocketAddr) -> io::Result<()> {
		self.0.connect(addr)
	}
}

/// The pair of transports backing one connection. The unreliable half is optional:
/// a peer that did not request (or was not granted) an unreliable channel during the
/// handshake only ever has `reliable`.
pub struct SocketPair {
	pub reliable: Box<dyn ReliableChannel>,
	pub unreliable: Option<Box<dyn UnreliableChannel>>,
	pub unreliable_peer: Option<SocketAddr>,
}

impl SocketPair {
	pub fn reliable_only(reliable: Box<dyn ReliableChannel>) -> Self {
		Self { reliable, unreliable: None, unreliable_peer: None }
	}

	pub fn with_unreliable(
		reliable: Box<dyn ReliableChannel>,
		unreliable: Box<dyn UnreliableChannel>,
		peer: SocketAddr,
	) -> Self {
		Self { reliable, unreliable: Some(unreliable), unreliable_peer: Some(peer) }
	}

	pub fn has_unreliable(&self) -> bool {
		self.unreliable.is_some()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::net::{Ipv4Addr, TcpListener};

	#[test]
	fn tcp_channel_round_trips_bytes() {
		let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
		let addr = listener.local_addr().unwrap();
		let client = std::thread::spawn(move || {
			let mut channel = StdTcpChannel::connect(addr, Duration::from_secs(1)).unwrap();
			channel.write_all(b"hello").unwrap();
		});
		let (server_stream, _) = listener.accept().unwrap();
		let mut server = StdTcpChannel::new(server_stream);
		let mut buf = [0u8; 5];
		let mut read = 0;
		while read < 5 {
			read += server.read(&mut buf[read..]).unwrap();
		}
		assert_eq!(&buf, b"hello");
		client.join().unwrap();
	}

	#[test]
	fn udp_channel_round_trips_datagram() {
		let a = StdUdpChannel::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
		let b = StdUdpChannel::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
		let b_addr = b.local_addr().unwrap();
		a.send_to(b"ping", b_addr).unwrap();
		let mut buf = [0u8; 4];
		let (n, _) = b.recv_from(&mut buf).unwrap();
		assert_eq!(&buf[..n], b"ping");
	}
}
