//! The process-wide readiness multiplexer (component G).
//!
//! Stands in for a real epoll/kqueue reactor: the low-level socket API is out of
//! scope for this engine (see the design notes), so readiness is approximated by a
//! single background thread that periodically polls every registered connection with
//! a non-blocking read attempt. Holds only [`Weak`] references to what it polls so a
//! connection being dropped elsewhere never gets stuck keeping its own readiness
//! registration alive (a cycle the teacher crate's `endpoint::demux` module inspired
//! this crate to avoid).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Something the multiplexer can poll for readiness and hand off to once readable.
pub trait Readable: Send + Sync {
	/// A cheap, non-blocking check for whether a read would make progress right now.
	fn poll_readable(&self) -> bool;
	/// Called once per detected readiness; expected to perform the actual read and
	/// post whatever events result from it.
	fn on_readable(&self);
}

/// An opaque token identifying one multiplexer registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

struct Inner {
	registrations: Mutex<HashMap<u64, Weak<dyn Readable>>>,
	next_id: AtomicU64,
}

/// The singleton scanning thread and its registration table.
pub struct Multiplexer {
	inner: Arc<Inner>,
	handle: Mutex<Option<JoinHandle<()>>>,
	shutdown: Arc<(Mutex<bool>, std::sync::Condvar)>,
}

const POLL_INTERVAL: Duration = Duration::from_millis(5);

impl Multiplexer {
	/// The process-wide multiplexer, started lazily on first access.
	pub fn global() -> &'static Multiplexer {
		static INSTANCE: OnceLock<Multiplexer> = OnceLock::new();
		INSTANCE.get_or_init(Multiplexer::start)
	}

	fn start() -> Self {
		let inner = Arc::new(Inner {
			registrations: Mutex::new(HashMap::new()),
			next_id: AtomicU64::new(0),
		});
		let shutdown = Arc::new((Mutex::new(false), std::sync::Condvar::new()));
		let worker_inner = inner.clone();
		let worker_shutdown = shutdown.clone();
		let handle = thread::Builder::new()
			.name("gne-multiplex".into())
			.spawn(move || Self::run(worker_inner, worker_shutdown))
			.expect("failed to spawn gne-multiplex thread");
		Self { inner, handle: Mutex::new(Some(handle)), shutdown }
	}

	fn run(inner: Arc<Inner>, shutdown: Arc<(Mutex<bool>, std::sync::Condvar)>) {
		let (lock, cvar) = &*shutdown;
		let mut guard = lock.lock().unwrap();
		loop {
			let (new_guard, timed_out) = cvar.wait_timeout(guard, POLL_INTERVAL).unwrap();
			guard = new_guard;
			if *guard {
				return;
			}
			if timed_out.timed_out() {
				Self::scan(&inner);
			}
		}
	}

	fn scan(inner: &Inner) {
		// Collect strong refs first so a readable callback can safely unregister its
		// own (dead) entry without deadlocking on the registrations lock.
		let live: Vec<(u64, Arc<dyn Readable>)> = {
			let mut map = inner.registrations.lock().unwrap();
			let mut live = Vec::with_capacity(map.len());
			map.retain(|&id, weak| match weak.upgrade() {
				Some(strong) => {
					live.push((id, strong));
					true
				}
				None => false,
			});
			live
		};
		for (_, readable) in live {
			if readable.poll_readable() {
				readable.on_readable();
			}
		}
	}

	/// Register a connection (or listener) for readiness polling. The returned id
	/// must be passed to [`unregister`](Self::unregister) when the registration is no
	/// longer needed; a dropped target is pruned automatically on the next scan.
	pub fn register(&self, readable: Weak<dyn Readable>) -> RegistrationId {
		let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
		self.inner.registrations.lock().unwrap().insert(id, readable);
		RegistrationId(id)
	}

	pub fn unregister(&self, id: RegistrationId) {
		self.inner.registrations.lock().unwrap().remove(&id.0);
	}

	#[cfg(test)]
	fn registration_count(&self) -> usize {
		self.inner.registrations.lock().unwrap().len()
	}
}

impl Drop for Multiplexer {
	fn drop(&mut self) {
		{
			let (lock, cvar) = &*self.shutdown;
			*lock.lock().unwrap() = true;
			cvar.notify_all();
		}
		if let Some(handle) = self.handle.lock().unwrap().take() {
			let _ = handle.join();
		}
	}
}
