//! Per-connection traffic counters.
//!
//! Not part of the distilled wire/state-machine surface, but every peer connection in
//! a real deployment needs *some* way to answer "how much have we sent/received", and
//! the teacher crate's historical endpoint layer tracked nothing at all — this is new
//! ground, grounded in the same `AtomicU64` counter style the teacher uses elsewhere
//! (see `multiplex::Inner::next_id`) rather than a mutex-guarded struct, since counters
//! are independent and never need to be read-modify-written together.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Running byte/packet counters for one connection, reset-able without tearing the
/// connection down.
#[derive(Debug)]
pub struct Stats {
	bytes_sent: AtomicU64,
	bytes_received: AtomicU64,
	packets_sent: AtomicU64,
	packets_received: AtomicU64,
	reset_at: std::sync::Mutex<Instant>,
}

impl Default for Stats {
	fn default() -> Self {
		Self {
			bytes_sent: AtomicU64::new(0),
			bytes_received: AtomicU64::new(0),
			packets_sent: AtomicU64::new(0),
			packets_received: AtomicU64::new(0),
			reset_at: std::sync::Mutex::new(Instant::now()),
		}
	}
}

impl Stats {
	pub fn bytes_sent(&self) -> u64 {
		self.bytes_sent.load(Ordering::Relaxed)
	}

	pub fn bytes_received(&self) -> u64 {
		self.bytes_received.load(Ordering::Relaxed)
	}

	pub fn packets_sent(&self) -> u64 {
		self.packets_sent.load(Ordering::Relaxed)
	}

	pub fn packets_received(&self) -> u64 {
		self.packets_received.load(Ordering::Relaxed)
	}

	/// Seconds (wall-clock, monotonic) since construction or the last [`reset`](Self::reset).
	pub fn elapsed_secs(&self) -> f64 {
		self.reset_at.lock().unwrap().elapsed().as_secs_f64()
	}

	/// Milliseconds since the Unix epoch at which these counters last started
	/// accumulating; informational only, like [`crate::time::Clock::wall_millis`].
	pub fn reset_wall_millis(&self) -> u64 {
		SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
	}

	pub(crate) fn record_sent(&self, bytes: usize, packets: usize) {
		self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
		self.packets_sent.fetch_add(packets as u64, Ordering::Relaxed);
	}

	pub(crate) fn record_received(&self, bytes: usize, packets: usize) {
		self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
		self.packets_received.fetch_add(packets as u64, Ordering::Relaxed);
	}

	/// Zero every counter and restart the elapsed-time clock.
	pub fn reset(&self) {
		self.bytes_sent.store(0, Ordering::Relaxed);
		self.bytes_received.store(0, Ordering::Relaxed);
		self.packets_sent.store(0, Ordering::Relaxed);
		self.packets_received.store(0, Ordering::Relaxed);
		*self.reset_at.lock().unwrap() = Instant::now();
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn counters_accumulate_and_reset() {
		let stats = Stats::default();
		stats.record_sent(10, 1);
		stats.record_received(20, 2);
		assert_eq!(stats.bytes_sent(), 10);
		assert_eq!(stats.bytes_received(), 20);
		assert_eq!(stats.packets_sent(), 1);
		assert_eq!(stats.packets_received(), 2);
		stats.reset();
		assert_eq!(stats.bytes_sent(), 0);
		assert_eq!(stats.packets_received(), 0);
	}
}
