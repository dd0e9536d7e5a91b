//! Bounded per-stream event history used for replay.

// std
use std::{
	collections::VecDeque,
	time::{Duration, Instant},
};
// self
use crate::_prelude::*;

/// Ordered log of the events published on one stream.
///
/// Ids are assigned here and nowhere else: each stored event receives the
/// decimal form of a counter that is monotonic for the lifetime of the
/// stream, so eviction never causes id reuse.
pub struct EventLog {
	entries: VecDeque<Arc<Event>>,
	next_id: u64,
	max_entries: usize,
	ttl: Option<Duration>,
}
impl EventLog {
	/// Create a log holding at most `max_entries` events (`0` for unbounded),
	/// optionally expiring entries older than `ttl`.
	pub fn new(max_entries: usize, ttl: Option<Duration>) -> Self {
		Self { entries: VecDeque::new(), next_id: 0, max_entries, ttl }
	}

	/// Stamp the event with the next id and the current time, store it and
	/// return it ready for fan-out.
	///
	/// Events without content (comment-only) are passed through unstored.
	/// A publisher-supplied id is overwritten.
	pub fn add(&mut self, mut event: Event) -> Arc<Event> {
		if !event.has_content() {
			return Arc::new(event);
		}

		event.id = self.next_id.to_string().into_bytes();
		event.timestamp = Some(Instant::now());
		self.next_id += 1;

		if self.max_entries > 0 && self.entries.len() == self.max_entries {
			self.entries.pop_front();
		}

		let event = Arc::new(event);

		self.entries.push_back(Arc::clone(&event));

		event
	}

	/// Drop expired entries. Called at publish time; there is no background
	/// timer.
	pub fn prune(&mut self) {
		let Some(ttl) = self.ttl else { return };
		let now = Instant::now();

		while let Some(front) = self.entries.front() {
			if front.timestamp.is_some_and(|t| now.duration_since(t) > ttl) {
				self.entries.pop_front();
			} else {
				break;
			}
		}
	}

	/// Entries whose numeric id is at least `resume_id`, in insertion order.
	pub fn replay_from(&self, resume_id: u64) -> impl Iterator<Item = Arc<Event>> + '_ {
		self.entries.iter().filter(move |ev| numeric_id(&ev.id) >= resume_id).cloned()
	}

	/// Number of stored events.
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Whether the log is empty.
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Discard every stored event. Id assignment continues where it left off.
	pub fn clear(&mut self) {
		self.entries.clear();
	}
}

fn numeric_id(id: &[u8]) -> u64 {
	std::str::from_utf8(id).ok().and_then(|s| s.parse().ok()).unwrap_or(0)
}
