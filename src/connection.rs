//! The connection state machine (component E): the GNE handshake, steady-state
//! read/write threads, and graceful/abrupt teardown.
//!
//! Generalizes the teacher crate's stubbed-out `connection::Connection<P, H>` (see the
//! historical `connection/connection.rs`, mostly `unimplemented!()`) into a concrete,
//! non-generic `Connection` built on [`crate::stream::PacketStream`],
//! [`crate::socket::SocketPair`] and [`crate::event::EventThread`].

use crate::error::{Error, ErrorKind};
use crate::event::{EventSender, EventThread, Listener};
use crate::multiplex::{self, Multiplexer, Readable, RegistrationId};
use crate::packet::{self, Packet, PingPacket, RateAdjustPacket, Received};
use crate::socket::{ReliableChannel, SocketPair, StdTcpChannel, StdUdpChannel, UnreliableChannel};
use crate::stats::Stats;
use crate::stream::{Feeder, PacketStream};
use crate::time::{Clock, PeriodicTimer, ShutdownFlag};
use crate::wire::{RawPacket, RAW_PACKET_CAPACITY};

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

mod wire_handshake;

pub use wire_handshake::ProtocolVersion;
use wire_handshake::{
	classify_refusal, effective_rate, read_crp, write_cap, write_crp, CrpPayload,
	REFUSE_USER_VERSION_MISMATCH, REFUSE_VERSION, REFUSE_WRONG_GAME,
};

/// The game identity and protocol version carried in every handshake.
///
/// `protocol` defaults to [`ProtocolVersion::CURRENT`] (this crate's own engine-level
/// wire version); applications only have a reason to override it when deliberately
/// testing cross-version behavior, since in real deployments both ends of a connection
/// link the same crate version.
#[derive(Debug, Clone)]
pub struct GameInfo {
	pub protocol: ProtocolVersion,
	pub name: String,
	pub user_version: u16,
}

impl GameInfo {
	pub fn new(name: impl Into<String>, user_version: u16) -> Self {
		Self { protocol: ProtocolVersion::CURRENT, name: name.into(), user_version }
	}

	pub fn with_protocol(mut self, protocol: ProtocolVersion) -> Self {
		self.protocol = protocol;
		self
	}
}

/// Per-connection configuration supplied to [`Connection::connect`] or to a
/// [`crate::server::ConnectionFactory`].
pub struct ConnectionParams {
	pub out_rate: u64,
	pub in_rate: u64,
	pub listener: Box<dyn Listener>,
	pub feeder: Option<Box<dyn Feeder>>,
	pub feeder_timeout: Duration,
	pub low_packet_threshold: usize,
	pub unrel: bool,
	pub timeout: Duration,
}

impl ConnectionParams {
	pub fn new(listener: Box<dyn Listener>) -> Self {
		Self {
			out_rate: 0,
			in_rate: 0,
			listener,
			feeder: None,
			feeder_timeout: Duration::from_millis(100),
			low_packet_threshold: 0,
			unrel: false,
			timeout: Duration::ZERO,
		}
	}

	pub fn with_rates(mut self, out_rate: u64, in_rate: u64) -> Self {
		self.out_rate = out_rate;
		self.in_rate = in_rate;
		self
	}

	pub fn with_feeder(mut self, feeder: Box<dyn Feeder>, low_packet_threshold: usize) -> Self {
		self.feeder = Some(feeder);
		self.low_packet_threshold = low_packet_threshold;
		self
	}

	pub fn with_unreliable(mut self, unrel: bool) -> Self {
		self.unrel = unrel;
		self
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}
}

/// Where a connection is in its lifecycle. See §4 of the design notes for the full
/// transition diagram; the short version: `Fresh -> Connecting -> Connected ->
/// Disconnecting -> Disconnected`, with `Failed` reachable from `Connecting` or
/// `Connected` on a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Fresh,
	Connecting,
	Connected,
	Disconnecting,
	Disconnected,
	Failed,
}

struct ReliableReadable(Weak<Connection>);

impl Readable for ReliableReadable {
	fn poll_readable(&self) -> bool {
		match self.0.upgrade() {
			Some(conn) => {
				let mut probe = [0u8; 1];
				matches!(conn.socket.lock().unwrap().reliable.peek(&mut probe), Ok(n) if n > 0)
			}
			None => false,
		}
	}

	fn on_readable(&self) {
		if let Some(conn) = self.0.upgrade() {
			conn.handle_readable();
		}
	}
}

/// One reliable (+ optionally unreliable) connection to a peer.
///
/// Always wrapped in `Arc`: the event thread, the readiness multiplexer's internal
/// registration, and the application all hold references. See the design notes (§9)
/// for how the multiplexer's registration avoids a reference cycle.
pub struct Connection {
	state: Mutex<ConnectionState>,
	peer_addr: SocketAddr,
	socket: Mutex<SocketPair>,
	stream: Arc<PacketStream>,
	clock: Clock,
	event_sender: Mutex<Option<EventSender>>,
	event_thread: Mutex<Option<EventThread>>,
	readable_handle: Mutex<Option<Arc<dyn Readable>>>,
	mux_registration: Mutex<Option<RegistrationId>>,
	writer_handle: Mutex<Option<JoinHandle<()>>>,
	unreliable_reader_handle: Mutex<Option<JoinHandle<()>>>,
	read_accum: Mutex<Vec<u8>>,
	timeout: Duration,
	next_deadline: Mutex<Option<Instant>>,
	timeout_timer: Mutex<Option<PeriodicTimer>>,
	disconnect_started: AtomicBool,
	unreliable_port: Option<u16>,
	stats: Stats,
	shutdown_flag: ShutdownFlag,
}

struct ClientHandshakeResult {
	effective_out_rate: u64,
	unreliable: Option<(SocketAddr, Box<dyn UnreliableChannel>)>,
	local_unreliable_port: Option<u16>,
}

struct AcceptedHandshakeResult {
	effective_out_rate: u64,
	unreliable: Option<(SocketAddr, Box<dyn UnreliableChannel>)>,
}

impl Connection {
	/// Open an outgoing connection to `addr`, blocking on the handshake.
	///
	/// On success, `params.listener.on_connect` has already been called synchronously
	/// (before this function returns) and the returned connection is `Connected`. On
	/// failure, `params.listener.on_connect_failure` has been called instead and the
	/// listener is dropped.
	pub fn connect(addr: SocketAddr, game: &GameInfo, mut params: ConnectionParams) -> Result<Arc<Connection>, Error> {
		crate::init();
		let connect_timeout = if params.timeout.is_zero() { Duration::from_secs(5) } else { params.timeout };
		let mut reliable: Box<dyn ReliableChannel> = match StdTcpChannel::connect(addr, connect_timeout) {
			Ok(channel) => Box::new(channel),
			Err(io_err) => {
				let error = Error::from_io(ErrorKind::CouldNotOpenSocket, &io_err);
				params.listener.on_connect_failure(&error);
				return Err(error);
			}
		};
		match Self::client_handshake(reliable.as_mut(), addr, game, &params) {
			Ok(handshake) => {
				let socket = match handshake.unreliable {
					Some((peer, unrel)) => SocketPair::with_unreliable(reliable, unrel, peer),
					None => SocketPair::reliable_only(reliable),
				};
				Ok(Self::finish(
					socket,
					addr,
					params,
					handshake.effective_out_rate,
					handshake.local_unreliable_port,
					true,
				))
			}
			Err(error) => {
				params.listener.on_connect_failure(&error);
				Err(error)
			}
		}
	}

	fn client_handshake(
		channel: &mut dyn ReliableChannel,
		addr: SocketAddr,
		game: &GameInfo,
		params: &ConnectionParams,
	) -> Result<ClientHandshakeResult, Error> {
		write_crp(channel, game, params.in_rate as u32, params.unrel)?;
		let cap = wire_handshake::read_cap(channel)?;
		if !cap.accept {
			return Err(classify_refusal(&cap, &game.protocol));
		}
		let effective_out_rate = effective_rate(params.out_rate, cap.advertised_in_rate);
		let mut unreliable = None;
		let mut local_unreliable_port = None;
		if params.unrel && cap.unrel_port >= 0 {
			let bind_addr = SocketAddr::new(unspecified_ip_for(addr), 0);
			if let Ok(udp) = StdUdpChannel::bind(bind_addr) {
				if let Ok(local_addr) = udp.local_addr() {
					let peer_unrel_addr = SocketAddr::new(addr.ip(), cap.unrel_port as u16);
					if udp.connect(peer_unrel_addr).is_ok()
						&& channel.write_all(&(local_addr.port() as i32).to_be_bytes()).is_ok()
					{
						local_unreliable_port = Some(local_addr.port());
						unreliable = Some((peer_unrel_addr, Box::new(udp) as Box<dyn UnreliableChannel>));
					}
				}
			}
			// A failure here degrades gracefully to a reliable-only connection rather
			// than failing the whole handshake: the peer already committed to offering
			// an unreliable channel, but nothing requires the client to use it.
		}
		Ok(ClientHandshakeResult { effective_out_rate, unreliable, local_unreliable_port })
	}

	/// Perform the server side of the handshake over an already-accepted socket.
	///
	/// `unreliable_template`, if present, is the server's shared listening datagram
	/// socket; a clone of it is handed to the connection when both sides negotiate an
	/// unreliable channel.
	pub(crate) fn accept(
		mut channel: Box<dyn ReliableChannel>,
		peer_addr: SocketAddr,
		game: &GameInfo,
		params: ConnectionParams,
		unreliable_template: Option<&dyn UnreliableChannel>,
	) -> Result<Arc<Connection>, Error> {
		match Self::server_handshake(channel.as_mut(), peer_addr, game, &params, unreliable_template) {
			Ok(handshake) => {
				let socket = match handshake.unreliable {
					Some((peer, unrel)) => SocketPair::with_unreliable(channel, unrel, peer),
					None => SocketPair::reliable_only(channel),
				};
				let unreliable_port = socket.unreliable.as_ref().and_then(|u| u.local_addr().ok()).map(|a| a.port());
				Ok(Self::finish(socket, peer_addr, params, handshake.effective_out_rate, unreliable_port, false))
			}
			Err(error) => Err(error),
		}
	}

	fn server_handshake(
		channel: &mut dyn ReliableChannel,
		peer_addr: SocketAddr,
		game: &GameInfo,
		params: &ConnectionParams,
		unreliable_template: Option<&dyn UnreliableChannel>,
	) -> Result<AcceptedHandshakeResult, Error> {
		let crp: CrpPayload = read_crp(channel)?;
		if crp.game_name != game.name {
			write_cap(channel, &game.protocol, false, REFUSE_WRONG_GAME, 0, -1)?;
			return Err(Error::new(ErrorKind::WrongGame));
		}
		if crp.user_version != game.user_version {
			write_cap(channel, &game.protocol, false, REFUSE_USER_VERSION_MISMATCH, 0, -1)?;
			return Err(Error::new(ErrorKind::UserVersionMismatch));
		}
		if crp.protocol.major != game.protocol.major || crp.protocol.minor > game.protocol.minor {
			write_cap(channel, &game.protocol, false, REFUSE_VERSION, 0, -1)?;
			let kind = if crp.protocol.major != game.protocol.major {
				if crp.protocol.major < game.protocol.major {
					ErrorKind::GNETheirVersionLow
				} else {
					ErrorKind::GNETheirVersionHigh
				}
			} else {
				ErrorKind::GNETheirVersionHigh
			};
			return Err(Error::new(kind));
		}

		let offer_unrel = params.unrel && crp.unrel_requested && unreliable_template.is_some();
		let (offered_port, local_unrel): (i32, Option<Box<dyn UnreliableChannel>>) = if offer_unrel {
			match unreliable_template.unwrap().try_clone() {
				Ok(cloned) => match cloned.local_addr() {
					Ok(addr) => (addr.port() as i32, Some(cloned)),
					Err(_) => (-1, None),
				},
				Err(_) => (-1, None),
			}
		} else {
			(-1, None)
		};

		write_cap(channel, &game.protocol, true, 0, params.in_rate as u32, offered_port)?;
		let effective_out_rate = effective_rate(params.out_rate, crp.advertised_in_rate);

		let unreliable = match local_unrel {
			Some(unrel_channel) => {
				let mut port_buf = [0u8; 4];
				read_exact_mapped(channel, &mut port_buf, ErrorKind::Read)?;
				let client_port = i32::from_be_bytes(port_buf);
				if (0..=u16::MAX as i32).contains(&client_port) {
					let peer_unrel_addr = SocketAddr::new(peer_addr.ip(), client_port as u16);
					unrel_channel
						.connect(peer_unrel_addr)
						.map_err(|e| Error::from_io(ErrorKind::CouldNotOpenSocket, &e))?;
					Some((peer_unrel_addr, unrel_channel))
				} else {
					None
				}
			}
			None => None,
		};

		Ok(AcceptedHandshakeResult { effective_out_rate, unreliable })
	}

	fn finish(
		mut socket: SocketPair,
		peer_addr: SocketAddr,
		mut params: ConnectionParams,
		effective_out_rate: u64,
		unreliable_port: Option<u16>,
		is_client: bool,
	) -> Arc<Connection> {
		// The handshake above used the channel's default blocking mode, which is the
		// right choice for the short-lived connect/accept worker. Steady state is
		// different: the readiness multiplexer's `poll_readable` shares one thread
		// across every registered connection, so a `peek` that blocks indefinitely on
		// a silent peer would starve every other connection's readiness notifications.
		// A short read timeout bounds that wait without changing `write_all`, which
		// never sets its own timeout and keeps its normal blocking semantics.
		socket.reliable.set_read_timeout(Some(Duration::from_millis(2))).ok();
		let clock = Clock;
		let feeder = params.feeder.take();
		let stream = Arc::new(PacketStream::new(
			effective_out_rate,
			params.low_packet_threshold,
			feeder,
			params.feeder_timeout,
			&clock,
		));
		stream.set_active(true);

		let connection = Arc::new(Connection {
			state: Mutex::new(ConnectionState::Connecting),
			peer_addr,
			socket: Mutex::new(socket),
			stream,
			clock,
			event_sender: Mutex::new(None),
			event_thread: Mutex::new(None),
			readable_handle: Mutex::new(None),
			mux_registration: Mutex::new(None),
			writer_handle: Mutex::new(None),
			unreliable_reader_handle: Mutex::new(None),
			read_accum: Mutex::new(Vec::new()),
			timeout: params.timeout,
			next_deadline: Mutex::new(None),
			timeout_timer: Mutex::new(None),
			disconnect_started: AtomicBool::new(false),
			unreliable_port,
			stats: Stats::default(),
			shutdown_flag: ShutdownFlag::new(),
		});

		// SyncConnection-equivalent: rather than a separate listener shim installed
		// for the handshake and swapped out under a dispatch lock, the handshake
		// thread simply calls the user's listener directly before the event thread
		// (which will serialize every later callback) ever starts.
		if is_client {
			params.listener.on_connect(&connection);
		} else {
			params.listener.on_new_conn(&connection);
		}

		let event_thread = EventThread::spawn(params.listener);
		*connection.event_sender.lock().unwrap() = Some(event_thread.sender());
		*connection.event_thread.lock().unwrap() = Some(event_thread);
		*connection.state.lock().unwrap() = ConnectionState::Connected;
		tracing::debug!(peer = %connection.peer_addr, is_client, "connection established");

		{
			let writer_conn = connection.clone();
			let handle = thread::Builder::new()
				.name("gne-writer".into())
				.spawn(move || writer_conn.run_writer())
				.expect("failed to spawn gne-writer thread");
			*connection.writer_handle.lock().unwrap() = Some(handle);
		}

		if connection.socket.lock().unwrap().has_unreliable() {
			let reader_conn = connection.clone();
			let handle = thread::Builder::new()
				.name("gne-unrel-reader".into())
				.spawn(move || reader_conn.run_unreliable_reader())
				.expect("failed to spawn gne-unrel-reader thread");
			*connection.unreliable_reader_handle.lock().unwrap() = Some(handle);
		}

		let readable: Arc<dyn Readable> = Arc::new(ReliableReadable(Arc::downgrade(&connection)));
		let registration = Multiplexer::global().register(Arc::downgrade(&readable));
		*connection.readable_handle.lock().unwrap() = Some(readable);
		*connection.mux_registration.lock().unwrap() = Some(registration);

		if !connection.timeout.is_zero() {
			connection.reset_timeout_deadline();
			let weak = Arc::downgrade(&connection);
			let interval = (connection.timeout / 2).max(Duration::from_millis(10));
			let timer = PeriodicTimer::start(interval, move || {
				if let Some(conn) = weak.upgrade() {
					conn.check_timeout();
				}
			});
			*connection.timeout_timer.lock().unwrap() = Some(timer);
		}

		connection
	}

	// -- steady-state operation --------------------------------------------------

	pub fn peer_addr(&self) -> SocketAddr {
		self.peer_addr
	}

	pub fn state(&self) -> ConnectionState {
		*self.state.lock().unwrap()
	}

	pub fn stats(&self) -> &Stats {
		&self.stats
	}

	pub fn effective_out_rate(&self) -> u64 {
		self.stream.out_rate()
	}

	/// The local unreliable port in use for this connection, if any: the ephemeral
	/// port the client bound (client side) or the server's shared listening port
	/// (server side). `None` if no unreliable channel was negotiated.
	pub fn unreliable_port(&self) -> Option<u16> {
		self.unreliable_port
	}

	pub fn send_reliable(&self, packet: Box<dyn Packet>) -> Result<(), Error> {
		self.stream.push_reliable(packet)
	}

	pub fn send_unreliable(&self, packet: Box<dyn Packet>) -> Result<(), Error> {
		if !self.socket.lock().unwrap().has_unreliable() {
			return Err(Error::new(ErrorKind::OtherGNELevelError));
		}
		self.stream.push_unreliable(packet)
	}

	pub fn receive(&self) -> Option<Received> {
		self.stream.pop_inbound()
	}

	pub fn has_inbound(&self) -> bool {
		self.stream.has_inbound()
	}

	/// Request that the peer change the rate it sends to us (`in_rate`) and/or change
	/// our own outbound rate (`out_rate`); both follow `TokenBucket::set_rate`'s
	/// `-1`-preserve/`0`-unlimited sentinel convention.
	pub fn set_rates(&self, out_rate: i64, in_rate: i64) {
		self.stream.set_out_rate(out_rate, &self.clock);
		if in_rate != -1 {
			let _ = self.stream.push_reliable(Box::new(RateAdjustPacket { new_rate: in_rate as i32 }));
		}
	}

	pub fn set_feeder(&self, feeder: Option<Box<dyn Feeder>>) {
		self.stream.set_feeder(feeder);
	}

	pub fn set_listener(&self, listener: Box<dyn Listener>) {
		if let Some(event_thread) = self.event_thread.lock().unwrap().as_ref() {
			event_thread.set_listener(listener);
		}
	}

	/// Queue a graceful disconnect: an [`crate::packet::ExitPacket`] is sent once the
	/// outbound queue drains, then both sockets are closed. Idempotent; safe to call
	/// more than once or from any thread.
	pub fn disconnect(self: &Arc<Self>) {
		self.begin_disconnect(true, None);
	}

	/// Like [`disconnect`](Self::disconnect), but blocks the caller until either the
	/// outbound queue has fully drained or `deadline` elapses.
	pub fn disconnect_send_all(self: &Arc<Self>, deadline: Duration) {
		let start = Instant::now();
		while self.stream.outbound_len() > 0 && start.elapsed() < deadline {
			thread::sleep(Duration::from_millis(5));
		}
		self.begin_disconnect(true, None);
	}

	/// Tear down the connection immediately because of a fatal error.
	pub(crate) fn fail(self: &Arc<Self>, error: Error) {
		self.begin_disconnect(false, Some(error));
	}

	fn begin_disconnect(self: &Arc<Self>, graceful: bool, failure: Option<Error>) {
		if self.disconnect_started.swap(true, Ordering::SeqCst) {
			return;
		}
		{
			let mut state = self.state.lock().unwrap();
			*state = if failure.is_some() { ConnectionState::Failed } else { ConnectionState::Disconnecting };
		}
		if let Some(error) = failure.clone() {
			tracing::warn!(peer = %self.peer_addr, %error, "connection failing");
			self.post_failure(error);
		} else {
			tracing::debug!(peer = %self.peer_addr, graceful, "connection disconnecting");
			// Every non-failure teardown is a graceful close from this connection's own
			// point of view, whether it was the local caller invoking `disconnect()` or
			// this side reacting to the peer's `ExitPacket` — both sides of scenario S1
			// observe `on_exit` before `on_disconnect`.
			self.post_exit();
		}
		if graceful {
			let _ = self.stream.push_reliable(Box::new(packet::ExitPacket::new()));
		}
		self.stream.shutdown();
		self.shutdown_flag.set();

		if let Some(handle) = self.writer_handle.lock().unwrap().take() {
			join_unless_current(handle);
		}
		if let Some(handle) = self.unreliable_reader_handle.lock().unwrap().take() {
			join_unless_current(handle);
		}
		if let Some(id) = self.mux_registration.lock().unwrap().take() {
			Multiplexer::global().unregister(id);
		}
		self.readable_handle.lock().unwrap().take();
		if let Some(timer) = self.timeout_timer.lock().unwrap().take() {
			timer.stop();
		}
		self.socket.lock().unwrap().reliable.shutdown();

		*self.state.lock().unwrap() = ConnectionState::Disconnected;
		tracing::debug!(peer = %self.peer_addr, "connection disconnected");
		self.post_disconnect();

		if let Some(mut event_thread) = self.event_thread.lock().unwrap().take() {
			event_thread.shutdown();
		}
	}

	// -- reader path ----------------------------------------------------------------

	fn handle_readable(self: &Arc<Self>) {
		let mut buf = [0u8; RAW_PACKET_CAPACITY];
		let read_result = self.socket.lock().unwrap().reliable.read(&mut buf);
		let n = match read_result {
			Ok(0) => {
				self.fail(Error::new(ErrorKind::ConnectionDropped));
				return;
			}
			Ok(n) => n,
			Err(err) if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut => return,
			Err(err) => {
				self.fail(Error::from_io(ErrorKind::Read, &err));
				return;
			}
		};
		self.stats.record_received(n, 0);

		let mut accum = self.read_accum.lock().unwrap();
		accum.extend_from_slice(&buf[..n]);
		loop {
			// The wire format has no inter-packet length prefix, so `accum` can
			// legitimately carry more than one frame's worth of bytes at once; only the
			// leading RAW_PACKET_CAPACITY bytes are ever relevant to the next frame.
			let prefix_len = accum.len().min(RAW_PACKET_CAPACITY);
			let mut raw = match RawPacket::from_bytes(&accum[..prefix_len]) {
				Ok(raw) => raw,
				Err(_) => break,
			};
			match packet::parse_next(&mut raw) {
				Ok(received) => {
					let consumed = raw.position();
					accum.drain(..consumed);
					drop(accum);
					self.stats.record_received(0, 1);
					self.handle_received(received);
					accum = self.read_accum.lock().unwrap();
				}
				Err(err) if err.kind() == ErrorKind::BufferUnderflow => {
					// A full-capacity prefix still doesn't contain one complete frame:
					// no further read can ever complete it.
					if prefix_len >= RAW_PACKET_CAPACITY {
						drop(accum);
						self.fail(Error::new(ErrorKind::ProtocolViolation));
						return;
					}
					break;
				}
				Err(err) => {
					accum.clear();
					drop(accum);
					self.post_error(err);
					return;
				}
			}
		}
		drop(accum);

		self.reset_timeout_deadline();
		self.post_receive();
	}

	fn run_unreliable_reader(self: Arc<Self>) {
		let mut buf = [0u8; RAW_PACKET_CAPACITY];
		loop {
			if self.shutdown_flag.is_set() {
				return;
			}
			let read_result = {
				let guard = self.socket.lock().unwrap();
				guard.unreliable.as_ref().map(|u| u.recv_from(&mut buf))
			};
			match read_result {
				Some(Ok((n, _from))) => {
					self.stats.record_received(n, 0);
					match RawPacket::from_bytes(&buf[..n]).and_then(|mut raw| packet::parse_next(&mut raw)) {
						Ok(received) => {
							self.stats.record_received(0, 1);
							self.handle_received(received);
							self.reset_timeout_deadline();
							self.post_receive();
						}
						Err(err) => self.post_error(err),
					}
				}
				Some(Err(err))
					if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut => {}
				Some(Err(_)) => {
					// Unreliable traffic is best-effort; a transient datagram I/O error
					// does not bring the connection down.
				}
				None => return,
			}
			thread::sleep(Duration::from_millis(5));
		}
	}

	fn handle_received(self: &Arc<Self>, received: Received) {
		if received.packet.type_id() == packet::EXIT_PACKET_ID {
			self.begin_disconnect(false, None);
			return;
		}
		if let Some(ping) = received.packet.as_any().downcast_ref::<PingPacket>() {
			if ping.request {
				let reply = PingPacket { request: false, ping_time: ping.ping_time };
				let _ = self.stream.push_reliable(Box::new(reply));
				return;
			}
			self.stream.push_inbound(received);
			return;
		}
		if let Some(adjust) = received.packet.as_any().downcast_ref::<RateAdjustPacket>() {
			self.stream.set_out_rate(adjust.new_rate as i64, &self.clock);
			return;
		}
		self.stream.push_inbound(received);
	}

	// -- writer path ------------------------------------------------------------------

	fn run_writer(self: Arc<Self>) {
		loop {
			self.stream.service_feeder_and_wait();
			if self.stream.is_shutdown() && self.stream.outbound_len() == 0 {
				return;
			}
			let (drained, now_empty) = self.stream.drain_ready(&self.clock);
			if drained.is_empty() {
				if self.stream.is_shutdown() && self.stream.outbound_len() == 0 {
					return;
				}
				// The queue is non-empty but the token bucket stalled `drain_ready`;
				// sleep until enough tokens accumulate for the head-of-line packet
				// instead of busy-spinning the writer thread.
				if let Some(bytes) = self.stream.next_required_bytes() {
					let wait = self.stream.time_until_bucket_refills(bytes);
					if wait > Duration::ZERO {
						thread::sleep(wait.min(Duration::from_millis(200)));
					}
				}
				continue;
			}

			let mut frame = RawPacket::new();
			let mut reliable_count = 0usize;
			let mut unreliable_items = Vec::new();
			for item in drained {
				match item {
					crate::stream::DrainedItem::Reliable(packet) => {
						match packet::serialize(packet.as_ref(), self.clock.wall_millis(), &mut frame) {
							Ok(()) => reliable_count += 1,
							Err(err) => self.post_error(err),
						}
					}
					crate::stream::DrainedItem::Unreliable(packet) => unreliable_items.push(packet),
				}
			}

			if frame.len() > 0 {
				let write_result = self.socket.lock().unwrap().reliable.write_all(frame.data());
				match write_result {
					Ok(()) => self.stats.record_sent(frame.len(), reliable_count),
					Err(io_err) => {
						self.fail(Error::from_io(ErrorKind::Write, &io_err));
						return;
					}
				}
			}

			for packet in unreliable_items {
				self.send_unreliable_datagram(packet.as_ref());
			}

			if now_empty && self.stream.mark_done_writing_if_needed() {
				self.post_done_writing();
			}
		}
	}

	fn send_unreliable_datagram(&self, packet: &dyn Packet) {
		let mut raw = RawPacket::new();
		if packet::serialize(packet, self.clock.wall_millis(), &mut raw).is_err() {
			return;
		}
		let guard = self.socket.lock().unwrap();
		if let (Some(channel), Some(peer)) = (&guard.unreliable, guard.unreliable_peer) {
			if channel.send_to(raw.data(), peer).is_ok() {
				self.stats.record_sent(raw.len(), 1);
			}
		}
	}

	// -- timeout ------------------------------------------------------------------------

	fn reset_timeout_deadline(&self) {
		if !self.timeout.is_zero() {
			*self.next_deadline.lock().unwrap() = Some(Instant::now() + self.timeout);
		}
	}

	fn check_timeout(self: &Arc<Self>) {
		let mut deadline_guard = self.next_deadline.lock().unwrap();
		if let Some(deadline) = *deadline_guard {
			if Instant::now() >= deadline {
				*deadline_guard = Some(Instant::now() + self.timeout);
				drop(deadline_guard);
				self.post_timeout();
			}
		}
	}

	// -- event posting -----------------------------------------------------------------

	fn sender(&self) -> Option<EventSender> {
		self.event_sender.lock().unwrap().clone()
	}

	fn post_receive(self: &Arc<Self>) {
		if let Some(sender) = self.sender() {
			sender.post_receive(self.clone());
		}
	}

	fn post_error(self: &Arc<Self>, error: Error) {
		tracing::debug!(peer = %self.peer_addr, kind = ?error.kind(), "recoverable connection error");
		if let Some(sender) = self.sender() {
			sender.post_error(self.clone(), error);
		}
	}

	fn post_failure(self: &Arc<Self>, error: Error) {
		if let Some(sender) = self.sender() {
			sender.post_failure(self.clone(), error);
		}
	}

	fn post_exit(self: &Arc<Self>) {
		if let Some(sender) = self.sender() {
			sender.post_exit(self.clone());
		}
	}

	fn post_timeout(self: &Arc<Self>) {
		if let Some(sender) = self.sender() {
			sender.post_timeout(self.clone());
		}
	}

	fn post_disconnect(self: &Arc<Self>) {
		if let Some(sender) = self.sender() {
			sender.post_disconnect(self.clone());
		}
	}

	fn post_done_writing(self: &Arc<Self>) {
		if let Some(sender) = self.sender() {
			sender.post_done_writing(self.clone());
		}
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		// Defensive: if a `Connection` is dropped without ever going through
		// `begin_disconnect` (e.g. the last `Arc` was simply let go), make sure its
		// background threads still get joined rather than left to run forever against
		// a socket nobody can reach any more.
		self.stream.shutdown();
		self.shutdown_flag.set();
		if let Some(handle) = self.writer_handle.lock().unwrap().take() {
			join_unless_current(handle);
		}
		if let Some(handle) = self.unreliable_reader_handle.lock().unwrap().take() {
			join_unless_current(handle);
		}
		if let Some(id) = self.mux_registration.lock().unwrap().take() {
			Multiplexer::global().unregister(id);
		}
	}
}

/// Join `handle` unless it is the thread we're currently running on.
///
/// Teardown can be initiated from the very thread it would otherwise join (the writer
/// or unreliable-reader thread failing its own I/O, or a `Listener` callback on the
/// event thread calling back into `disconnect()`). Joining yourself blocks forever, so
/// in that case the handle is simply dropped instead: the thread is already unwinding
/// out of this call and will exit on its own once control returns to it.
fn join_unless_current(handle: JoinHandle<()>) {
	if handle.thread().id() != thread::current().id() {
		let _ = handle.join();
	}
}

fn read_exact_mapped(channel: &mut dyn ReliableChannel, buf: &mut [u8], err_kind: ErrorKind) -> Result<(), Error> {
	let mut read = 0;
	while read < buf.len() {
		match channel.read(&mut buf[read..]) {
			Ok(0) => return Err(Error::new(ErrorKind::ConnectionDropped)),
			Ok(n) => read += n,
			Err(err) => return Err(Error::from_io(err_kind, &err)),
		}
	}
	Ok(())
}

fn unspecified_ip_for(peer: SocketAddr) -> std::net::IpAddr {
	match peer {
		SocketAddr::V4(_) => std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
		SocketAddr::V6(_) => std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
	}
}

#[cfg(test)]
pub(crate) mod test_support {
	use super::*;
	use std::net::{Ipv4Addr, SocketAddr};

	struct NullChannel;

	impl ReliableChannel for NullChannel {
		fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
			Ok(0)
		}
		fn write_all(&mut self, _buf: &[u8]) -> io::Result<()> {
			Ok(())
		}
		fn peek(&self, _buf: &mut [u8]) -> io::Result<usize> {
			Ok(0)
		}
		fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
			Ok(())
		}
		fn peer_addr(&self) -> io::Result<SocketAddr> {
			Ok(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0))
		}
		fn try_clone(&self) -> io::Result<Box<dyn ReliableChannel>> {
			Ok(Box::new(NullChannel))
		}
		fn shutdown(&mut self) {}
	}

	pub(crate) fn dummy_connection() -> Arc<Connection> {
		let clock = Clock;
		let socket = SocketPair::reliable_only(Box::new(NullChannel));
		Arc::new(Connection {
			state: Mutex::new(ConnectionState::Connected),
			peer_addr: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0),
			socket: Mutex::new(socket),
			stream: Arc::new(PacketStream::new(0, 0, None, Duration::from_millis(100), &clock)),
			clock,
			event_sender: Mutex::new(None),
			event_thread: Mutex::new(None),
			readable_handle: Mutex::new(None),
			mux_registration: Mutex::new(None),
			writer_handle: Mutex::new(None),
			unreliable_reader_handle: Mutex::new(None),
			read_accum: Mutex::new(Vec::new()),
			timeout: Duration::ZERO,
			next_deadline: Mutex::new(None),
			timeout_timer: Mutex::new(None),
			disconnect_started: AtomicBool::new(false),
			unreliable_port: None,
			stats: Stats::default(),
			shutdown_flag: ShutdownFlag::new(),
		})
	}
}
