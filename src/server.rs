//! Registry of named streams and publish dispatch.

// std
use std::{
	collections::HashMap,
	sync::MutexGuard,
	time::Duration,
};
// self
use crate::{
	_prelude::*,
	stream::{Registry, Stream, StreamConfig, SubscriberCallback, Subscription},
};

/// Default capacity of each stream's publish channel.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// SSE hub: a set of named streams, each fanning out to its subscribers.
///
/// Cloning shares the same registry, so a clone can be handed to an HTTP
/// router as state while the original keeps publishing. The mutex guards only
/// the name map; everything per-stream is serialized by that stream's own
/// loop.
#[derive(Clone)]
pub struct Server {
	streams: Arc<Registry>,
	buffer_size: usize,
	auto_stream: bool,
	auto_replay: bool,
	encode_base64: bool,
	split_data: bool,
	event_ttl: Option<Duration>,
	max_entries: usize,
	headers: Vec<(String, String)>,
	on_subscribe: Option<SubscriberCallback>,
	on_unsubscribe: Option<SubscriberCallback>,
}
impl Server {
	/// Create a server with default options: replay on, auto streams off,
	/// plain-text payloads, unbounded log, no TTL.
	pub fn new() -> Self {
		Self {
			streams: Arc::new(Registry::default()),
			buffer_size: DEFAULT_BUFFER_SIZE,
			auto_stream: false,
			auto_replay: true,
			encode_base64: false,
			split_data: true,
			event_ttl: None,
			max_entries: 0,
			headers: Vec::new(),
			on_subscribe: None,
			on_unsubscribe: None,
		}
	}

	/// Set the publish-channel capacity of streams created afterwards.
	pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
		self.buffer_size = buffer_size;

		self
	}

	/// Auto-create unknown streams on subscribe and reclaim them once their
	/// last subscriber leaves.
	pub fn with_auto_stream(mut self, auto_stream: bool) -> Self {
		self.auto_stream = auto_stream;

		self
	}

	/// Keep an event log per stream and replay it to new subscribers.
	pub fn with_auto_replay(mut self, auto_replay: bool) -> Self {
		self.auto_replay = auto_replay;

		self
	}

	/// Base64-encode payloads before sending. Clients must mirror the flag.
	pub fn with_base64(mut self, encode_base64: bool) -> Self {
		self.encode_base64 = encode_base64;

		self
	}

	/// Emit one `data:` line per payload fragment instead of a single raw
	/// line.
	pub fn with_split_data(mut self, split_data: bool) -> Self {
		self.split_data = split_data;

		self
	}

	/// Drop logged events older than `ttl`; enforced at publish time.
	pub fn with_event_ttl(mut self, ttl: Duration) -> Self {
		self.event_ttl = Some(ttl);

		self
	}

	/// Cap the event log at `max_entries` (`0` for unbounded).
	pub fn with_max_entries(mut self, max_entries: usize) -> Self {
		self.max_entries = max_entries;

		self
	}

	/// Add a header to every streaming response.
	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.push((name.into(), value.into()));

		self
	}

	/// Run `callback` whenever a subscriber joins any stream.
	pub fn with_on_subscribe(mut self, callback: impl Fn(&str, u64) + Send + Sync + 'static) -> Self {
		self.on_subscribe = Some(Arc::new(callback));

		self
	}

	/// Run `callback` whenever a subscriber leaves any stream.
	pub fn with_on_unsubscribe(
		mut self,
		callback: impl Fn(&str, u64) + Send + Sync + 'static,
	) -> Self {
		self.on_unsubscribe = Some(Arc::new(callback));

		self
	}

	/// Get the stream named `id`, creating and starting it first if needed.
	pub fn create_stream(&self, id: &str) -> Stream {
		self.create(id, false)
	}

	/// Close and drop the stream named `id`. Safe to call when absent.
	pub fn remove_stream(&self, id: &str) {
		if let Some(stream) = self.lock().remove(id) {
			stream.close();
			tracing::debug!("stream {id} removed");
		}
	}

	/// Whether a stream named `id` currently exists.
	pub fn stream_exists(&self, id: &str) -> bool {
		self.lock().contains_key(id)
	}

	/// Publish an event on the stream named `id`.
	///
	/// A missing stream is a silent no-op. Blocks while the stream's publish
	/// buffer is full.
	pub async fn publish(&self, id: &str, event: Event) {
		let Some(stream) = self.get_stream(id) else { return };

		stream.publish(self.prepare(event)).await;
	}

	/// Non-blocking [`publish`](Self::publish); returns whether the event was
	/// accepted by the stream's buffer.
	pub fn try_publish(&self, id: &str, event: Event) -> bool {
		let Some(stream) = self.get_stream(id) else { return false };

		stream.try_publish(self.prepare(event))
	}

	/// Attach a reader directly, without HTTP, resuming from `resume_id`.
	pub fn subscribe(&self, id: &str, resume_id: u64) -> Option<Subscription> {
		self.get_stream(id).map(|stream| stream.subscribe(resume_id))
	}

	/// Close every stream and empty the registry.
	pub fn close(&self) {
		for (_, stream) in self.lock().drain() {
			stream.close();
		}
	}

	/// Extra headers for streaming responses.
	pub fn headers(&self) -> &[(String, String)] {
		&self.headers
	}

	pub(crate) fn auto_stream(&self) -> bool {
		self.auto_stream
	}

	pub(crate) fn split_data(&self) -> bool {
		self.split_data
	}

	pub(crate) fn get_stream(&self, id: &str) -> Option<Stream> {
		self.lock().get(id).cloned()
	}

	pub(crate) fn create_auto_stream(&self, id: &str) -> Stream {
		self.create(id, true)
	}

	fn create(&self, id: &str, auto: bool) -> Stream {
		let mut streams = self.lock();

		if let Some(stream) = streams.get(id) {
			return stream.clone();
		}

		let stream = Stream::spawn(id, StreamConfig {
			buffer_size: self.buffer_size,
			auto_replay: self.auto_replay,
			max_entries: self.max_entries,
			event_ttl: self.event_ttl,
			on_subscribe: self.on_subscribe.clone(),
			on_unsubscribe: self.on_unsubscribe.clone(),
			registry: auto.then(|| Arc::downgrade(&self.streams)),
		});

		streams.insert(id.to_owned(), stream.clone());
		tracing::debug!("stream {id} created");

		stream
	}

	fn prepare(&self, mut event: Event) -> Event {
		if self.encode_base64 {
			event.encode_base64();
		}

		event
	}

	fn lock(&self) -> MutexGuard<'_, HashMap<String, Stream>> {
		self.streams.lock().expect("stream registry must not be poisoned; qed")
	}
}
impl Default for Server {
	fn default() -> Self {
		Self::new()
	}
}
