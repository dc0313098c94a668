//! The per-connection event thread and the `Listener` callback contract.
//!
//! Generalizes the teacher crate's lack of an event-dispatch thread (the historical
//! UDP-ack layer delivered packets synchronously to whoever called `receive()`) to the
//! dedicated-thread delivery model this engine's concurrency design calls for: every
//! callback for a given connection runs on that connection's single event thread, one
//! at a time, never concurrently with another callback for the same connection.
//!
//! Delivery is *not* a plain FIFO of everything ever posted. `receive`/`timeout`/
//! `exit`/`disconnect` are sticky, idempotent flags: posting one of them again before
//! the event thread has drained the previous posting is a no-op, not a second queued
//! delivery. `error` is the one exception — every distinct error is queued and
//! eventually delivered, never collapsed. Each time the event thread has something to
//! dispatch it picks exactly one pending signal in a fixed priority order — `failure`
//! first, `error` last — dispatches it, releases the lock, and repeats. `disconnect`
//! is terminal: once it is dispatched the thread exits and delivers nothing further,
//! even if other signals were still pending.

use crate::connection::Connection;
use crate::error::Error;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// Application hook for one connection's lifecycle.
///
/// All methods default to doing nothing, so implementors only override what they
/// care about. Every method is called from the connection's own event thread, never
/// concurrently with another callback for the *same* connection; callbacks for
/// different connections may run on different threads at the same time.
pub trait Listener: Send {
	/// The outgoing connection attempt's handshake succeeded and the connection is now
	/// `Connected`. Invoked synchronously on the handshake thread, before the event
	/// thread starts, never through the posted-event queue below.
	fn on_connect(&mut self, _conn: &Arc<Connection>) {}
	/// A server-accepted socket's handshake succeeded. Invoked synchronously on that
	/// connection's handshake worker thread, the accept-side counterpart to
	/// [`on_connect`](Self::on_connect).
	fn on_new_conn(&mut self, _conn: &Arc<Connection>) {}
	/// An outgoing [`crate::connection::Connection::connect`] call failed before a
	/// connection ever came into being, so there is no `Arc<Connection>` to hand back.
	/// Invoked synchronously, on the caller's own thread.
	fn on_connect_failure(&mut self, _error: &Error) {}
	/// One or more packets are now available via [`Connection::receive`].
	fn on_receive(&mut self, _conn: &Arc<Connection>) {}
	/// A non-fatal error occurred; the connection is still usable.
	fn on_error(&mut self, _conn: &Arc<Connection>, _error: &Error) {}
	/// A fatal error occurred; the connection is being torn down.
	fn on_failure(&mut self, _conn: &Arc<Connection>, _error: &Error) {}
	/// An [`crate::packet::ExitPacket`] was received: the peer disconnected gracefully.
	fn on_exit(&mut self, _conn: &Arc<Connection>) {}
	/// The connection attempt, or an established connection's keepalive, timed out.
	fn on_timeout(&mut self, _conn: &Arc<Connection>) {}
	/// The connection has fully torn down and will deliver no further events.
	fn on_disconnect(&mut self, _conn: &Arc<Connection>) {}
	/// The outbound queue drained to empty after having had packets in it.
	fn on_done_writing(&mut self, _conn: &Arc<Connection>) {}
}

/// The events a connection's I/O threads may post to its event thread.
pub(crate) enum Event {
	Connect,
	Receive,
	Error(Error),
	Failure(Error),
	Exit,
	Timeout,
	Disconnect,
	DoneWriting,
}

fn dispatch(listener: &mut dyn Listener, connection: &Arc<Connection>, event: Event) {
	match event {
		Event::Connect => listener.on_connect(connection),
		Event::Receive => listener.on_receive(connection),
		Event::Error(error) => listener.on_error(connection, &error),
		Event::Failure(error) => listener.on_failure(connection, &error),
		Event::Exit => listener.on_exit(connection),
		Event::Timeout => listener.on_timeout(connection),
		Event::Disconnect => listener.on_disconnect(connection),
		Event::DoneWriting => listener.on_done_writing(connection),
	}
}

/// The sticky flags plus the `onError` queue, guarded by `Shared::lock`.
///
/// `connect` and `done_writing` are this crate's own additions on top of the priority
/// scheme above — no production code path posts either through this queue today
/// (`on_connect`/`on_new_conn` are called synchronously before the event thread is
/// even listening), but both still behave as sticky, idempotent signals and are kept
/// below `error` so they can never preempt the events the priority order exists for.
struct EventState {
	connection: Option<Arc<Connection>>,
	failure: Option<Error>,
	exit: bool,
	disconnect: bool,
	receive: bool,
	timeout: bool,
	errors: VecDeque<Error>,
	done_writing: bool,
	connect: bool,
	shutdown: bool,
}

impl EventState {
	fn new() -> Self {
		Self {
			connection: None,
			failure: None,
			exit: false,
			disconnect: false,
			receive: false,
			timeout: false,
			errors: VecDeque::new(),
			done_writing: false,
			connect: false,
			shutdown: false,
		}
	}

	/// Pick and clear exactly one pending signal, highest priority first. Returns
	/// `None` when nothing is pending (the caller should wait).
	fn take_next(&mut self) -> Option<(Event, Arc<Connection>)> {
		let connection = self.connection.clone()?;
		if let Some(error) = self.failure.take() {
			return Some((Event::Failure(error), connection));
		}
		if self.exit {
			self.exit = false;
			return Some((Event::Exit, connection));
		}
		if self.disconnect {
			self.disconnect = false;
			return Some((Event::Disconnect, connection));
		}
		if self.receive {
			self.receive = false;
			return Some((Event::Receive, connection));
		}
		if self.timeout {
			self.timeout = false;
			return Some((Event::Timeout, connection));
		}
		if let Some(error) = self.errors.pop_front() {
			return Some((Event::Error(error), connection));
		}
		if self.done_writing {
			self.done_writing = false;
			return Some((Event::DoneWriting, connection));
		}
		if self.connect {
			self.connect = false;
			return Some((Event::Connect, connection));
		}
		None
	}
}

struct Shared {
	state: Mutex<EventState>,
	condvar: Condvar,
}

/// A handle for posting events to a connection's event thread, cheaply cloned and
/// handed to the reader/writer/handshake threads that observe I/O for that connection.
#[derive(Clone)]
pub(crate) struct EventSender {
	shared: Arc<Shared>,
}

impl EventSender {
	fn mark(&self, connection: Arc<Connection>, set: impl FnOnce(&mut EventState)) {
		let mut state = self.shared.state.lock().unwrap();
		state.connection = Some(connection);
		set(&mut state);
		drop(state);
		self.shared.condvar.notify_one();
	}

	pub fn post_connect(&self, connection: Arc<Connection>) {
		self.mark(connection, |s| s.connect = true);
	}

	pub fn post_receive(&self, connection: Arc<Connection>) {
		self.mark(connection, |s| s.receive = true);
	}

	pub fn post_error(&self, connection: Arc<Connection>, error: Error) {
		self.mark(connection, |s| s.errors.push_back(error));
	}

	pub fn post_failure(&self, connection: Arc<Connection>, error: Error) {
		self.mark(connection, |s| s.failure = Some(error));
	}

	pub fn post_exit(&self, connection: Arc<Connection>) {
		self.mark(connection, |s| s.exit = true);
	}

	pub fn post_timeout(&self, connection: Arc<Connection>) {
		self.mark(connection, |s| s.timeout = true);
	}

	pub fn post_disconnect(&self, connection: Arc<Connection>) {
		self.mark(connection, |s| s.disconnect = true);
	}

	pub fn post_done_writing(&self, connection: Arc<Connection>) {
		self.mark(connection, |s| s.done_writing = true);
	}
}

/// Owns the dedicated thread that serializes callback delivery for one connection.
pub(crate) struct EventThread {
	shared: Arc<Shared>,
	listener: Arc<Mutex<Box<dyn Listener>>>,
	handle: Option<JoinHandle<()>>,
}

impl EventThread {
	pub fn spawn(listener: Box<dyn Listener>) -> Self {
		let shared = Arc::new(Shared { state: Mutex::new(EventState::new()), condvar: Condvar::new() });
		let worker_shared = shared.clone();
		let listener = Arc::new(Mutex::new(listener));
		let worker_listener = listener.clone();
		let handle = thread::Builder::new()
			.name("gne-event".into())
			.spawn(move || loop {
				let (event, connection) = {
					let mut state = worker_shared.state.lock().unwrap();
					loop {
						if let Some(found) = state.take_next() {
							break found;
						}
						if state.shutdown {
							return;
						}
						state = worker_shared.condvar.wait(state).unwrap();
					}
				};
				let terminal = matches!(event, Event::Disconnect);
				let mut listener = worker_listener.lock().unwrap();
				dispatch(&mut **listener, &connection, event);
				drop(listener);
				if terminal {
					// onDisconnect is always the last event a connection delivers.
					return;
				}
			})
			.expect("failed to spawn gne-event thread");
		Self { shared, listener, handle: Some(handle) }
	}

	pub fn sender(&self) -> EventSender {
		EventSender { shared: self.shared.clone() }
	}

	/// Swap the listener. Blocks until any callback currently being dispatched
	/// returns, so the new listener never observes a half-delivered event.
	pub fn set_listener(&self, listener: Box<dyn Listener>) {
		*self.listener.lock().unwrap() = listener;
	}

	/// Signal the event thread to stop and wait for it to exit.
	///
	/// A `Listener` callback is free to call [`Connection::disconnect`](crate::connection::Connection::disconnect)
	/// on its own connection, which routes back here from the very event thread this
	/// call would otherwise join. Joining yourself blocks forever, so when `shutdown`
	/// is invoked from the event thread it already owns, it only signals and returns;
	/// the thread exits on its own once the callback that called it returns.
	pub fn shutdown(&mut self) {
		{
			let mut state = self.shared.state.lock().unwrap();
			state.shutdown = true;
		}
		self.shared.condvar.notify_one();
		if let Some(handle) = self.handle.take() {
			if handle.thread().id() != thread::current().id() {
				let _ = handle.join();
			}
		}
	}
}

impl Drop for EventThread {
	fn drop(&mut self) {
		self.shutdown();
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::connection::test_support::dummy_connection;
	use crate::error::ErrorKind;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::mpsc::{self, SyncSender};
	use std::time::Duration;

	struct CountingListener {
		connects: Arc<AtomicUsize>,
		disconnects: Arc<AtomicUsize>,
	}

	impl Listener for CountingListener {
		fn on_connect(&mut self, _conn: &Arc<Connection>) {
			self.connects.fetch_add(1, Ordering::SeqCst);
		}
		fn on_disconnect(&mut self, _conn: &Arc<Connection>) {
			self.disconnects.fetch_add(1, Ordering::SeqCst);
		}
	}

	#[test]
	fn set_listener_replaces_callbacks() {
		let mut thread = EventThread::spawn(Box::new(CountingListener {
			connects: Arc::new(AtomicUsize::new(0)),
			disconnects: Arc::new(AtomicUsize::new(0)),
		}));
		let connects = Arc::new(AtomicUsize::new(0));
		thread.set_listener(Box::new(CountingListener {
			connects: connects.clone(),
			disconnects: Arc::new(AtomicUsize::new(0)),
		}));
		thread.sender().post_connect(dummy_connection());
		thread.shutdown();
		thread::sleep(Duration::from_millis(1));
		assert_eq!(connects.load(Ordering::SeqCst), 1);
	}

	/// A listener that records the order callbacks ran in, and pauses inside
	/// `on_receive` until told to continue — used to let a test queue up several
	/// lower-priority signals behind one that is already being dispatched.
	struct OrderingListener {
		order: Arc<Mutex<Vec<&'static str>>>,
		entered: SyncSender<()>,
		gate: std::sync::mpsc::Receiver<()>,
	}

	impl Listener for OrderingListener {
		fn on_receive(&mut self, _conn: &Arc<Connection>) {
			self.order.lock().unwrap().push("receive");
			let _ = self.entered.send(());
			let _ = self.gate.recv();
		}
		fn on_timeout(&mut self, _conn: &Arc<Connection>) {
			self.order.lock().unwrap().push("timeout");
		}
		fn on_error(&mut self, _conn: &Arc<Connection>, _error: &Error) {
			self.order.lock().unwrap().push("error");
		}
		fn on_exit(&mut self, _conn: &Arc<Connection>) {
			self.order.lock().unwrap().push("exit");
		}
		fn on_disconnect(&mut self, _conn: &Arc<Connection>) {
			self.order.lock().unwrap().push("disconnect");
		}
	}

	#[test]
	fn higher_priority_events_preempt_lower_ones_already_pending() {
		let order = Arc::new(Mutex::new(Vec::new()));
		let (entered_tx, entered_rx) = mpsc::sync_channel::<()>(0);
		let (gate_tx, gate_rx) = mpsc::sync_channel::<()>(0);
		let mut thread = EventThread::spawn(Box::new(OrderingListener {
			order: order.clone(),
			entered: entered_tx,
			gate: gate_rx,
		}));
		let sender = thread.sender();
		let connection = dummy_connection();

		// Get the event thread stuck inside on_receive so the rest of this batch
		// piles up as pending state instead of racing the thread for the lock.
		sender.post_receive(connection.clone());
		entered_rx.recv().unwrap();

		sender.post_timeout(connection.clone());
		sender.post_error(connection.clone(), Error::new(ErrorKind::ConnectionTimeOut));
		sender.post_exit(connection.clone());
		sender.post_disconnect(connection);
		gate_tx.send(()).unwrap();

		thread.shutdown();
		// `exit` and `disconnect` outrank the queued `timeout`/`error`, and
		// `disconnect` is terminal, so neither of those ever gets delivered.
		assert_eq!(*order.lock().unwrap(), vec!["receive", "exit", "disconnect"]);
	}

	#[test]
	fn distinct_errors_are_each_delivered() {
		let order = Arc::new(Mutex::new(Vec::new()));
		let (entered_tx, entered_rx) = mpsc::sync_channel::<()>(0);
		let (gate_tx, gate_rx) = mpsc::sync_channel::<()>(0);
		let mut thread = EventThread::spawn(Box::new(OrderingListener {
			order: order.clone(),
			entered: entered_tx,
			gate: gate_rx,
		}));
		let sender = thread.sender();
		let connection = dummy_connection();

		sender.post_receive(connection.clone());
		entered_rx.recv().unwrap();
		sender.post_error(connection.clone(), Error::new(ErrorKind::ConnectionTimeOut));
		sender.post_error(connection.clone(), Error::new(ErrorKind::Read));
		gate_tx.send(()).unwrap();

		thread.shutdown();
		assert_eq!(*order.lock().unwrap(), vec!["receive", "error", "error"]);
	}
}
