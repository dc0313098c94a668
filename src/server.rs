//! The server listener (component H): accepts incoming connections and runs each
//! one's handshake on its own short-lived worker thread.
//!
//! Generalizes the teacher crate's `Listener<E, P>` (see `examples/technomunk-gnet/
//! src/listener.rs`, a non-blocking `try_accept` over a single shared endpoint) into a
//! dedicated accept thread backed by a real `TcpListener`: the teacher's endpoint was
//! already connectionless UDP, so accepting meant popping a queued packet, but this
//! engine's reliable channel is a TCP stream and each accepted socket needs its own
//! handshake before it becomes a connection.

use crate::connection::{Connection, ConnectionParams, GameInfo};
use crate::error::Error;
use crate::socket::{StdTcpChannel, StdUdpChannel, UnreliableChannel};

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Supplies per-connection configuration and observes the outcome of each accepted
/// socket's handshake.
///
/// Implementations are expected to be cheap to call from the accept thread; anything
/// expensive belongs in the [`crate::event::Listener`] the factory hands back, which
/// runs on that connection's own event thread instead.
pub trait ConnectionFactory: Send {
	/// Called once per accepted socket, before its handshake runs. The returned
	/// params decide the listener, feeder, rates and timeout this connection will
	/// use if the handshake succeeds.
	fn get_new_connection_params(&mut self, from: SocketAddr) -> ConnectionParams;
	/// The handshake succeeded and `conn` is now `Connected`.
	fn on_listen_success(&mut self, conn: &Arc<Connection>);
	/// The handshake failed; no connection was created. `from` is the peer address
	/// of the socket that was accepted, which is all the factory gets back since
	/// there is no connection to hand it.
	fn on_listen_failure(&mut self, error: &Error, from: SocketAddr);
}

/// A bound reliable (and optionally unreliable) listening socket, handing off every
/// accepted peer to its own handshake worker thread.
pub struct ServerListener {
	local_addr: SocketAddr,
	shutdown: Arc<AtomicBool>,
	accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ServerListener {
	/// Bind a reliable listening socket at `addr` and start accepting in the
	/// background. If `unreliable` is `true`, also binds a UDP socket at the same
	/// port, a clone of which is handed to every accepted connection that negotiates
	/// an unreliable channel (see `Connection::accept`'s `unreliable_template`).
	pub fn bind(
		addr: SocketAddr,
		game: GameInfo,
		unreliable: bool,
		factory: Box<dyn ConnectionFactory>,
	) -> Result<Self, Error> {
		crate::init();
		let listener = TcpListener::bind(addr).map_err(|e| {
			Error::from_io(crate::error::ErrorKind::CouldNotOpenSocket, &e)
		})?;
		let local_addr = listener.local_addr().map_err(|e| {
			Error::from_io(crate::error::ErrorKind::CouldNotOpenSocket, &e)
		})?;

		let unreliable_template: Option<Arc<Box<dyn UnreliableChannel>>> = if unreliable {
			Some(Arc::new(Box::new(StdUdpChannel::bind(local_addr).map_err(|e| {
				Error::from_io(crate::error::ErrorKind::CouldNotOpenSocket, &e)
			})?)))
		} else {
			None
		};

		let shutdown = Arc::new(AtomicBool::new(false));
		let worker_shutdown = shutdown.clone();
		let factory: Arc<Mutex<Box<dyn ConnectionFactory>>> = Arc::new(Mutex::new(factory));
		let handle = thread::Builder::new()
			.name("gne-accept".into())
			.spawn(move || run_accept_loop(listener, game, unreliable_template, factory, worker_shutdown))
			.expect("failed to spawn gne-accept thread");

		Ok(Self { local_addr, shutdown, accept_handle: Mutex::new(Some(handle)) })
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// Stop accepting new connections. Does not affect connections already handed
	/// off to the application; callers are responsible for disconnecting those
	/// themselves. Blocks until the accept thread notices and exits, which may take
	/// up to the accept loop's poll interval. In-flight handshake worker threads for
	/// sockets already accepted are not tracked or joined here — they are short-lived
	/// by design and either finish on their own or are talking to a peer that will
	/// eventually time out.
	pub fn shutdown(&self) {
		self.shutdown.store(true, Ordering::SeqCst);
		if let Some(handle) = self.accept_handle.lock().unwrap().take() {
			let _ = handle.join();
		}
	}
}

impl Drop for ServerListener {
	fn drop(&mut self) {
		self.shutdown();
	}
}

fn run_accept_loop(
	listener: TcpListener,
	game: GameInfo,
	unreliable_template: Option<Arc<Box<dyn UnreliableChannel>>>,
	factory: Arc<Mutex<Box<dyn ConnectionFactory>>>,
	shutdown: Arc<AtomicBool>,
) {
	// A read timeout on the listener itself would require `TcpListener::set_nonblocking`
	// plus a poll loop; using a short accept timeout via the listener's underlying
	// socket is not exposed by `std`, so shutdown is instead observed once per
	// accepted connection, same as the teacher's own polling style elsewhere
	// (`multiplex.rs`'s scan loop).
	listener.set_nonblocking(true).ok();
	while !shutdown.load(Ordering::SeqCst) {
		match listener.accept() {
			Ok((stream, from)) => {
				let game = game.clone();
				let template = unreliable_template.clone();
				let factory = factory.clone();
				let channel = StdTcpChannel::new(stream);
				tracing::debug!(peer = %from, "accepted connection, starting handshake");
				// The handshake runs on its own short-lived thread so one slow or
				// stalled peer can never hold up accepting the next connection.
				let spawned = thread::Builder::new().name("gne-handshake".into()).spawn(move || {
					run_handshake(channel, from, game, template, factory);
				});
				if let Err(err) = spawned {
					tracing::warn!(peer = %from, error = %err, "failed to spawn handshake worker thread");
				}
			}
			Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
				thread::sleep(std::time::Duration::from_millis(5));
			}
			Err(_) => {
				thread::sleep(std::time::Duration::from_millis(5));
			}
		}
	}
}

fn run_handshake(
	channel: StdTcpChannel,
	from: SocketAddr,
	game: GameInfo,
	unreliable_template: Option<Arc<Box<dyn UnreliableChannel>>>,
	factory: Arc<Mutex<Box<dyn ConnectionFactory>>>,
) {
	let params = factory.lock().unwrap().get_new_connection_params(from);
	let template = unreliable_template.as_deref().map(|b| b.as_ref());
	match Connection::accept(Box::new(channel), from, &game, params, template) {
		Ok(conn) => {
			tracing::debug!(peer = %from, "server handshake succeeded");
			factory.lock().unwrap().on_listen_success(&conn);
		}
		Err(error) => {
			tracing::warn!(peer = %from, %error, "server handshake failed");
			factory.lock().unwrap().on_listen_failure(&error, from);
		}
	}
}
