//! Deadline-ordered timer queue for single-threaded poll loops.
//!
//! The queue never sleeps; the owner asks for the next deadline, waits however
//! it likes, then pops whatever is due. Timers with equal deadlines fire in
//! insertion order.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// A fired timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired<T> {
	pub id: TimerId,
	pub deadline: Instant,
	pub payload: T,
}

#[derive(Debug)]
pub struct TimerQueue<T> {
	next_id: u64,
	entries: BTreeMap<(Instant, TimerId), T>,
	deadlines: HashMap<TimerId, Instant>,
}

impl<T> TimerQueue<T> {
	pub fn new() -> Self {
		Self {
			next_id: 0,
			entries: BTreeMap::new(),
			deadlines: HashMap::new(),
		}
	}

	/// Schedules `payload` to fire `delay` after `now`.
	pub fn add(&mut self, now: Instant, delay: Duration, payload: T) -> TimerId {
		let id = TimerId(self.next_id);
		self.next_id += 1;
		let deadline = now + delay;
		self.entries.insert((deadline, id), payload);
		self.deadlines.insert(id, deadline);
		id
	}

	/// Cancels a timer, returning its payload when it was still pending.
	pub fn remove(&mut self, id: TimerId) -> Option<T> {
		let deadline = self.deadlines.remove(&id)?;
		self.entries.remove(&(deadline, id))
	}

	pub fn contains(&self, id: TimerId) -> bool {
		self.deadlines.contains_key(&id)
	}

	pub fn len(&self) -> usize {
		self.deadlines.len()
	}

	pub fn is_empty(&self) -> bool {
		self.deadlines.is_empty()
	}

	pub fn next_deadline(&self) -> Option<Instant> {
		self.entries.keys().next().map(|(deadline, _)| *deadline)
	}

	/// Pops the earliest timer whose deadline is at or before `now`.
	pub fn pop_due(&mut self, now: Instant) -> Option<Expired<T>> {
		match self.next_deadline() {
			Some(deadline) if deadline <= now => self.pop_next(),
			_ => None,
		}
	}

	/// Pops the earliest timer regardless of its deadline.
	pub fn pop_next(&mut self) -> Option<Expired<T>> {
		let ((deadline, id), payload) = self.entries.pop_first()?;
		self.deadlines.remove(&id);
		Some(Expired { id, deadline, payload })
	}
}

impl<T> Default for TimerQueue<T> {
	fn default() -> Self {
		Self::new()
	}
}
