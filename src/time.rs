//! Monotonic clock and periodic-callback timer utilities.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A handle to the process' monotonic high-resolution clock.
///
/// Backed by [`std::time::Instant`], which on every platform this crate targets is
/// already monotonic and nanosecond-resolution; this type exists so that call sites
/// name the engine's clock rather than reaching for `Instant::now()` directly, keeping
/// the door open for a mockable clock in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct Clock;

impl Clock {
	/// Current instant of the monotonic clock.
	#[inline]
	pub fn now(&self) -> Instant {
		Instant::now()
	}

	/// Milliseconds since the Unix epoch, truncated to 32 bits, for wire timestamps.
	///
	/// Wraps roughly every 49 days; the protocol only uses this for informational
	/// and latency-probing purposes, never for ordering.
	pub fn wall_millis(&self) -> u32 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_millis() as u32
	}
}

/// A periodic timer that invokes a user callback from a dedicated thread.
///
/// `stop()` blocks until any in-flight callback invocation returns, guaranteeing the
/// callback never races its own teardown.
pub struct PeriodicTimer {
	shutdown: Arc<(Mutex<bool>, Condvar)>,
	handle: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
	/// Start a timer that calls `callback` every `interval`, from a fresh thread.
	pub fn start<F>(interval: Duration, mut callback: F) -> Self
	where
		F: FnMut() + Send + 'static,
	{
		let shutdown = Arc::new((Mutex::new(false), Condvar::new()));
		let thread_shutdown = shutdown.clone();
		let handle = thread::Builder::new()
			.name("gne-timer".into())
			.spawn(move || {
				let (lock, cvar) = &*thread_shutdown;
				let mut guard = lock.lock().unwrap();
				loop {
					let (new_guard, timed_out) =
						cvar.wait_timeout(guard, interval).unwrap();
					guard = new_guard;
					if *guard {
						break;
					}
					if timed_out.timed_out() {
						callback();
					}
				}
			})
			.expect("failed to spawn gne-timer thread");
		Self { shutdown, handle: Some(handle) }
	}

	/// Stop the timer, blocking until any in-flight callback returns.
	pub fn stop(mut self) {
		self.stop_inner();
	}

	fn stop_inner(&mut self) {
		{
			let (lock, cvar) = &*self.shutdown;
			let mut guard = lock.lock().unwrap();
			*guard = true;
			cvar.notify_all();
		}
		if let Some(handle) = self.handle.take() {
			let _ = handle.join();
		}
	}
}

impl Drop for PeriodicTimer {
	fn drop(&mut self) {
		self.stop_inner();
	}
}

/// A one-shot flag that can be checked cheaply across threads, used to signal shutdown
/// to loops that otherwise block on I/O or condition variables.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
	pub fn new() -> Self {
		Self(Arc::new(AtomicBool::new(false)))
	}

	pub fn set(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_set(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::atomic::AtomicUsize;

	#[test]
	fn periodic_timer_fires_repeatedly() {
		let count = Arc::new(AtomicUsize::new(0));
		let counted = count.clone();
		let timer = PeriodicTimer::start(Duration::from_millis(10), move || {
			counted.fetch_add(1, Ordering::SeqCst);
		});
		thread::sleep(Duration::from_millis(55));
		timer.stop();
		assert!(count.load(Ordering::SeqCst) >= 3);
	}

	#[test]
	fn shutdown_flag_is_visible_across_clones() {
		let flag = ShutdownFlag::new();
		let clone = flag.clone();
		assert!(!clone.is_set());
		flag.set();
		assert!(clone.is_set());
	}
}
