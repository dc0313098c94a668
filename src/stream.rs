//! Rate-limited, feeder-driven outbound/inbound packet queues for one connection.
//!
//! Generalizes the teacher crate's queue-and-condvar plumbing (see `connection/deliver.rs`
//! in the historical UDP-ack layer this replaces) to the byte-rate token bucket and
//! FIFO framing this engine's wire protocol calls for.

use crate::error::{Error, ErrorKind};
use crate::packet::{Packet, Received};
use crate::time::Clock;
use crate::wire::RAW_PACKET_CAPACITY;

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A byte-budget that refills continuously at `rate` bytes/sec, up to one second of
/// burst capacity. `rate == 0` means unlimited: [`try_consume`](Self::try_consume)
/// always succeeds and [`time_until_available`](Self::time_until_available) is zero.
#[derive(Debug)]
pub struct TokenBucket {
	rate: u64,
	tokens: f64,
	last_refill: Instant,
}

impl TokenBucket {
	pub fn new(rate: u64, now: Instant) -> Self {
		Self { rate, tokens: rate as f64, last_refill: now }
	}

	/// Apply `setRates` semantics: `-1` preserves the current rate, `0` lifts the cap,
	/// any other (non-negative) value becomes the new bytes/sec cap.
	pub fn set_rate(&mut self, rate: i64) {
		match rate {
			-1 => {}
			0 => {
				self.rate = 0;
				self.tokens = 0.0;
			}
			r if r > 0 => {
				self.rate = r as u64;
				self.tokens = self.tokens.min(self.rate as f64);
			}
			_ => {}
		}
	}

	pub fn rate(&self) -> u64 {
		self.rate
	}

	pub fn refill(&mut self, now: Instant) {
		if self.rate == 0 {
			self.last_refill = now;
			return;
		}
		let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
		self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.rate as f64);
		self.last_refill = now;
	}

	/// Attempt to spend `bytes` tokens, returning whether it succeeded.
	pub fn try_consume(&mut self, bytes: u64) -> bool {
		if self.rate == 0 {
			return true;
		}
		if self.tokens >= bytes as f64 {
			self.tokens -= bytes as f64;
			true
		} else {
			false
		}
	}

	/// How long until `bytes` tokens will be available, assuming no further spending.
	pub fn time_until_available(&self, bytes: u64) -> Duration {
		if self.rate == 0 || self.tokens >= bytes as f64 {
			return Duration::ZERO;
		}
		let missing = bytes as f64 - self.tokens;
		Duration::from_secs_f64(missing / self.rate as f64)
	}
}

/// A user-supplied producer invoked when the outbound queue runs low, letting the
/// application generate packets just in time instead of buffering them ahead.
///
/// May run concurrently with listener callbacks for the same connection on another
/// thread; implementations must guard their own state accordingly (see §5 of the
/// design: the feeder is deliberately not serialized against the event thread).
pub trait Feeder: Send {
	fn on_low_packets(&mut self, handle: &StreamHandle<'_>);
}

struct QueuedPacket {
	packet: Box<dyn Packet>,
	reliable: bool,
}

pub(crate) enum DrainedItem {
	Reliable(Box<dyn Packet>),
	Unreliable(Box<dyn Packet>),
}

struct Inner {
	outbound: VecDeque<QueuedPacket>,
	inbound: VecDeque<Received>,
	out_bucket: TokenBucket,
	low_packet_threshold: usize,
	feeder: Option<Box<dyn Feeder>>,
	feeder_timeout: Duration,
	done_writing: bool,
	active: bool,
	shutdown: bool,
}

/// Per-connection rate-limited transport: outbound/inbound FIFOs, the out-direction
/// token bucket, and the feeder hook.
pub struct PacketStream {
	inner: Mutex<Inner>,
	not_empty: Condvar,
}

impl PacketStream {
	pub fn new(
		out_rate: u64,
		low_packet_threshold: usize,
		feeder: Option<Box<dyn Feeder>>,
		feeder_timeout: Duration,
		clock: &Clock,
	) -> Self {
		Self {
			inner: Mutex::new(Inner {
				outbound: VecDeque::new(),
				inbound: VecDeque::new(),
				out_bucket: TokenBucket::new(out_rate, clock.now()),
				low_packet_threshold,
				feeder,
				feeder_timeout,
				done_writing: true,
				active: false,
				shutdown: false,
			}),
			not_empty: Condvar::new(),
		}
	}

	/// Gate the feeder: it is only ever invoked while the owning connection is
	/// Connected.
	pub fn set_active(&self, active: bool) {
		self.inner.lock().unwrap().active = active;
	}

	pub fn set_out_rate(&self, rate: i64, clock: &Clock) {
		let mut inner = self.inner.lock().unwrap();
		inner.out_bucket.refill(clock.now());
		inner.out_bucket.set_rate(rate);
	}

	pub fn out_rate(&self) -> u64 {
		self.inner.lock().unwrap().out_bucket.rate()
	}

	/// Replace (or clear) the feeder. Per design note (§9), changing feeders mid-flight
	/// is only safe outside event delivery; callers are expected to route through
	/// [`crate::connection::Connection::set_feeder`], which enforces that.
	pub fn set_feeder(&self, feeder: Option<Box<dyn Feeder>>) {
		self.inner.lock().unwrap().feeder = feeder;
	}

	fn enqueue(&self, packet: Box<dyn Packet>, reliable: bool) -> Result<(), Error> {
		if packet.size() + 5 > RAW_PACKET_CAPACITY {
			return Err(Error::new(ErrorKind::PacketTooBig));
		}
		let mut inner = self.inner.lock().unwrap();
		inner.outbound.push_back(QueuedPacket { packet, reliable });
		inner.done_writing = false;
		self.not_empty.notify_one();
		Ok(())
	}

	pub fn push_reliable(&self, packet: Box<dyn Packet>) -> Result<(), Error> {
		self.enqueue(packet, true)
	}

	pub fn push_unreliable(&self, packet: Box<dyn Packet>) -> Result<(), Error> {
		self.enqueue(packet, false)
	}

	pub fn outbound_len(&self) -> usize {
		self.inner.lock().unwrap().outbound.len()
	}

	pub fn push_inbound(&self, received: Received) {
		self.inner.lock().unwrap().inbound.push_back(received);
	}

	pub fn pop_inbound(&self) -> Option<Received> {
		self.inner.lock().unwrap().inbound.pop_front()
	}

	pub fn has_inbound(&self) -> bool {
		!self.inner.lock().unwrap().inbound.is_empty()
	}

	pub fn is_shutdown(&self) -> bool {
		self.inner.lock().unwrap().shutdown
	}

	/// Signal shutdown: wakes any writer currently parked waiting for work.
	pub fn shutdown(&self) {
		let mut inner = self.inner.lock().unwrap();
		inner.shutdown = true;
		self.not_empty.notify_all();
	}

	/// Step 1 of the writer loop: service the feeder if the queue is at or below the
	/// low-packet threshold, then block (with `feeder_timeout` deadline) if the queue
	/// is still empty afterwards.
	pub(crate) fn service_feeder_and_wait(&self) {
		let mut inner = self.inner.lock().unwrap();
		if inner.shutdown {
			return;
		}
		let low = inner.outbound.len() <= inner.low_packet_threshold;
		if low && inner.active && inner.feeder.is_some() {
			// Taken out of Inner for the duration of the call: the feeder must never be
			// invoked re-entrantly on the same stream, and dropping the lock lets other
			// threads (the writer's own condvar notifications aside) keep progressing.
			let mut feeder = inner.feeder.take().unwrap();
			drop(inner);
			feeder.on_low_packets(&StreamHandle { stream: self });
			inner = self.inner.lock().unwrap();
			if inner.feeder.is_none() {
				inner.feeder = Some(feeder);
			}
		}
		if inner.outbound.is_empty() && !inner.shutdown {
			let timeout = inner.feeder_timeout;
			let _ = self.not_empty.wait_timeout(inner, timeout).unwrap();
		}
	}

	/// Step 2-5 of the writer loop: refill the token bucket and drain as many queued
	/// packets as fit both the frame budget and the current bucket balance. Returns
	/// the drained items (in FIFO order within each reliability class) and whether the
	/// outbound queue is empty as a result.
	pub(crate) fn drain_ready(&self, clock: &Clock) -> (Vec<DrainedItem>, bool) {
		let mut inner = self.inner.lock().unwrap();
		inner.out_bucket.refill(clock.now());
		let mut drained = Vec::new();
		let mut frame_bytes = 0usize;
		loop {
			let is_reliable = match inner.outbound.front() {
				None => break,
				Some(q) => q.reliable,
			};
			if is_reliable {
				let needed = inner.outbound.front().unwrap().packet.size() + 5;
				if frame_bytes + needed > RAW_PACKET_CAPACITY {
					break;
				}
				if !inner.out_bucket.try_consume(needed as u64) {
					break;
				}
				frame_bytes += needed;
				let queued = inner.outbound.pop_front().unwrap();
				drained.push(DrainedItem::Reliable(queued.packet));
			} else {
				let queued = inner.outbound.pop_front().unwrap();
				drained.push(DrainedItem::Unreliable(queued.packet));
			}
		}
		let now_empty = inner.outbound.is_empty();
		(drained, now_empty)
	}

	/// How long the writer should sleep before a refill would let `bytes` through, used
	/// when `drain_ready` returned nothing because the bucket, not the queue, was empty.
	pub(crate) fn time_until_bucket_refills(&self, bytes: u64) -> Duration {
		self.inner.lock().unwrap().out_bucket.time_until_available(bytes)
	}

	/// The byte cost of the head-of-line packet, if the outbound queue is non-empty.
	/// Used by the writer to size its sleep when `drain_ready` stalled on the token
	/// bucket rather than draining the queue.
	pub(crate) fn next_required_bytes(&self) -> Option<u64> {
		self.inner.lock().unwrap().outbound.front().map(|q| (q.packet.size() + 5) as u64)
	}

	/// Mark the done-writing transition exactly once per empty-transition, returning
	/// whether `on_done_writing` should now be fired.
	pub(crate) fn mark_done_writing_if_needed(&self) -> bool {
		let mut inner = self.inner.lock().unwrap();
		if !inner.done_writing {
			inner.done_writing = true;
			true
		} else {
			false
		}
	}
}

/// A narrow handle a [`Feeder`] uses to enqueue packets without seeing the rest of the
/// stream's internals.
pub struct StreamHandle<'a> {
	stream: &'a PacketStream,
}

impl StreamHandle<'_> {
	pub fn push_reliable(&self, packet: Box<dyn Packet>) -> Result<(), Error> {
		self.stream.push_reliable(packet)
	}

	pub fn push_unreliable(&self, packet: Box<dyn Packet>) -> Result<(), Error> {
		self.stream.push_unreliable(packet)
	}

	pub fn queue_len(&self) -> usize {
		self.stream.outbound_len()
	}
}
