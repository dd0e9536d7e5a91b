//! Per-stream coordinator: one loop task serializes registrations,
//! deregistrations, publications and shutdown.

// std
use std::{
	collections::HashMap,
	sync::{
		Mutex, Weak,
		atomic::{AtomicU64, Ordering},
	},
	time::Duration,
};
// crates.io
use tokio::sync::mpsc;
// self
use crate::{_prelude::*, log::EventLog};

/// Queue capacity of one subscriber.
pub const SUBSCRIBER_QUEUE_SIZE: usize = 64;

/// Callback fired when a subscriber joins or leaves a stream, with the stream
/// name and the subscriber token. Runs as a detached task so it can never
/// stall the stream loop.
pub type SubscriberCallback = Arc<dyn Fn(&str, u64) + Send + Sync>;

pub(crate) type Registry = Mutex<HashMap<String, Stream>>;

/// Per-stream behavior, fixed by the server at creation.
pub(crate) struct StreamConfig {
	pub buffer_size: usize,
	pub auto_replay: bool,
	pub max_entries: usize,
	pub event_ttl: Option<Duration>,
	pub on_subscribe: Option<SubscriberCallback>,
	pub on_unsubscribe: Option<SubscriberCallback>,
	/// Present on auto-created streams: the registry to vacate once the last
	/// subscriber leaves.
	pub registry: Option<Weak<Registry>>,
}

/// Loop-side half of one connected reader.
struct Subscriber {
	id: u64,
	queue: mpsc::Sender<Arc<Event>>,
}

struct Register {
	subscriber: Subscriber,
	resume_id: u64,
}

/// Handle to a running stream loop.
///
/// The loop task is the sole mutator of the subscriber set; this handle only
/// carries messages into it, so it is cheap to clone and safe to share.
#[derive(Clone)]
pub struct Stream {
	name: String,
	publish_tx: mpsc::Sender<Event>,
	register_tx: mpsc::UnboundedSender<Register>,
	deregister_tx: mpsc::UnboundedSender<u64>,
	quit_tx: mpsc::UnboundedSender<()>,
	next_subscriber_id: Arc<AtomicU64>,
}
impl Stream {
	pub(crate) fn spawn(name: impl Into<String>, config: StreamConfig) -> Self {
		let name = name.into();
		let (publish_tx, publish_rx) = mpsc::channel(config.buffer_size);
		let (register_tx, register_rx) = mpsc::unbounded_channel();
		let (deregister_tx, deregister_rx) = mpsc::unbounded_channel();
		let (quit_tx, quit_rx) = mpsc::unbounded_channel();
		let stream_loop = StreamLoop {
			name: name.clone(),
			subscribers: Vec::new(),
			log: config
				.auto_replay
				.then(|| EventLog::new(config.max_entries, config.event_ttl)),
			on_subscribe: config.on_subscribe,
			on_unsubscribe: config.on_unsubscribe,
			registry: config.registry,
			publish_rx,
			register_rx,
			deregister_rx,
			quit_rx,
		};

		tokio::spawn(stream_loop.run());

		Self {
			name,
			publish_tx,
			register_tx,
			deregister_tx,
			quit_tx,
			next_subscriber_id: Arc::new(AtomicU64::new(0)),
		}
	}

	/// Stream name.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Register a new reader resuming from `resume_id`.
	pub fn subscribe(&self, resume_id: u64) -> Subscription {
		let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
		let (queue, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_SIZE);
		let _ = self.register_tx.send(Register { subscriber: Subscriber { id, queue }, resume_id });

		Subscription {
			receiver,
			guard: DeregisterGuard { id, deregister_tx: self.deregister_tx.clone() },
		}
	}

	/// Hand an event to the stream loop.
	///
	/// Blocks while the stream's publish buffer is full.
	pub async fn publish(&self, event: Event) {
		let _ = self.publish_tx.send(event).await;
	}

	/// Non-blocking publish; returns whether the event was accepted.
	pub fn try_publish(&self, event: Event) -> bool {
		self.publish_tx.try_send(event).is_ok()
	}

	/// Stop the loop, closing every subscriber queue. Idempotent.
	pub fn close(&self) {
		let _ = self.quit_tx.send(());
	}
}

/// Consumer half of one registered reader.
///
/// Exactly one producer (the stream loop) feeds the queue; dropping the
/// subscription deregisters the reader, which is how client disconnects are
/// propagated back into the loop.
pub struct Subscription {
	receiver: mpsc::Receiver<Arc<Event>>,
	guard: DeregisterGuard,
}
impl Subscription {
	/// Receive the next event; [`None`] once the stream has closed the queue.
	pub async fn recv(&mut self) -> Option<Arc<Event>> {
		self.receiver.recv().await
	}

	/// Subscriber token, as passed to the subscribe/unsubscribe callbacks.
	pub fn id(&self) -> u64 {
		self.guard.id
	}

	pub(crate) fn into_parts(self) -> (mpsc::Receiver<Arc<Event>>, DeregisterGuard) {
		(self.receiver, self.guard)
	}
}

pub(crate) struct DeregisterGuard {
	id: u64,
	deregister_tx: mpsc::UnboundedSender<u64>,
}
impl Drop for DeregisterGuard {
	fn drop(&mut self) {
		let _ = self.deregister_tx.send(self.id);
	}
}

struct StreamLoop {
	name: String,
	subscribers: Vec<Subscriber>,
	log: Option<EventLog>,
	on_subscribe: Option<SubscriberCallback>,
	on_unsubscribe: Option<SubscriberCallback>,
	registry: Option<Weak<Registry>>,
	publish_rx: mpsc::Receiver<Event>,
	register_rx: mpsc::UnboundedReceiver<Register>,
	deregister_rx: mpsc::UnboundedReceiver<u64>,
	quit_rx: mpsc::UnboundedReceiver<()>,
}
impl StreamLoop {
	async fn run(mut self) {
		tracing::debug!("stream {} started", self.name);

		loop {
			tokio::select! {
				Some(registration) = self.register_rx.recv() => self.register(registration).await,
				Some(id) = self.deregister_rx.recv() =>
					if self.deregister(id) {
						break;
					},
				Some(event) = self.publish_rx.recv() => self.publish(event).await,
				_ = self.quit_rx.recv() => break,
				else => break,
			}
		}

		// Dropping the senders closes every subscriber queue exactly once.
		self.subscribers.clear();

		tracing::debug!("stream {} stopped", self.name);
	}

	async fn register(&mut self, registration: Register) {
		let Register { subscriber, resume_id } = registration;

		if let Some(log) = &self.log {
			for event in log.replay_from(resume_id) {
				if subscriber.queue.send(event).await.is_err() {
					break;
				}
			}
		}

		let id = subscriber.id;

		self.subscribers.push(subscriber);
		self.notify(self.on_subscribe.clone(), id);
	}

	/// Remove a subscriber; returns `true` when an auto stream has emptied
	/// and the loop should shut itself down.
	fn deregister(&mut self, id: u64) -> bool {
		let Some(i) = self.subscribers.iter().position(|s| s.id == id) else {
			return false;
		};

		self.subscribers.remove(i);
		self.notify(self.on_unsubscribe.clone(), id);

		if self.subscribers.is_empty()
			&& let Some(registry) = &self.registry
		{
			if let Some(registry) = registry.upgrade()
				&& let Ok(mut streams) = registry.lock()
			{
				streams.remove(&self.name);
			}

			return true;
		}

		false
	}

	async fn publish(&mut self, event: Event) {
		let event = match &mut self.log {
			Some(log) => {
				log.prune();

				log.add(event)
			},
			None => Arc::new(event),
		};
		let mut dead = Vec::new();

		for subscriber in &self.subscribers {
			// A full queue blocks the loop until this subscriber drains; a
			// dropped receiver marks the subscriber dead instead.
			if subscriber.queue.send(Arc::clone(&event)).await.is_err() {
				dead.push(subscriber.id);
			}
		}
		for id in dead {
			self.deregister(id);
		}
	}

	fn notify(&self, callback: Option<SubscriberCallback>, id: u64) {
		if let Some(callback) = callback {
			let name = self.name.clone();

			tokio::spawn(async move { callback(&name, id) });
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn plain(buffer_size: usize, auto_replay: bool) -> StreamConfig {
		StreamConfig {
			buffer_size,
			auto_replay,
			max_entries: 0,
			event_ttl: None,
			on_subscribe: None,
			on_unsubscribe: None,
			registry: None,
		}
	}

	#[tokio::test]
	async fn fan_out_should_reach_every_subscriber() {
		let stream = Stream::spawn("test", plain(16, false));
		let mut subscriptions = (0..10).map(|_| stream.subscribe(0)).collect::<Vec<_>>();

		// Registration and publication travel on different channels; let the
		// loop drain the registrations first.
		tokio::task::yield_now().await;
		stream.publish(Event::new("test")).await;

		for subscription in &mut subscriptions {
			assert_eq!(subscription.recv().await.unwrap().data, b"test");
		}
	}

	#[tokio::test]
	async fn publication_order_should_be_preserved() {
		let stream = Stream::spawn("test", plain(16, false));
		let mut subscription = stream.subscribe(0);

		tokio::task::yield_now().await;

		for i in 0..5 {
			stream.publish(Event::new(format!("test {i}"))).await;
		}
		for i in 0..5 {
			assert_eq!(subscription.recv().await.unwrap().data, format!("test {i}").into_bytes());
		}
	}

	#[tokio::test]
	async fn replay_should_precede_live_events() {
		let stream = Stream::spawn("test", plain(16, true));

		stream.publish(Event::new("test 1")).await;
		stream.publish(Event::new("test 2")).await;

		// Let the loop absorb the publications before registering.
		tokio::task::yield_now().await;

		let mut subscription = stream.subscribe(1);

		stream.publish(Event::new("test 3")).await;

		assert_eq!(subscription.recv().await.unwrap().data, b"test 2");
		assert_eq!(subscription.recv().await.unwrap().data, b"test 3");
	}

	#[tokio::test]
	async fn close_should_end_every_subscription() {
		let stream = Stream::spawn("test", plain(16, false));
		let mut a = stream.subscribe(0);
		let mut b = stream.subscribe(0);

		stream.close();

		assert_eq!(a.recv().await, None);
		assert_eq!(b.recv().await, None);
	}

	#[tokio::test]
	async fn callbacks_should_fire_detached() {
		let (joined_tx, mut joined_rx) = mpsc::unbounded_channel();
		let (left_tx, mut left_rx) = mpsc::unbounded_channel();
		let mut config = plain(16, false);

		config.on_subscribe = Some(Arc::new(move |name: &str, id| {
			let _ = joined_tx.send((name.to_owned(), id));
		}));
		config.on_unsubscribe = Some(Arc::new(move |name: &str, id| {
			let _ = left_tx.send((name.to_owned(), id));
		}));

		let stream = Stream::spawn("test", config);
		let subscription = stream.subscribe(0);

		assert_eq!(joined_rx.recv().await.unwrap(), ("test".to_owned(), subscription.id()));

		let id = subscription.id();

		drop(subscription);

		assert_eq!(left_rx.recv().await.unwrap(), ("test".to_owned(), id));
	}

	#[tokio::test]
	async fn dropping_subscription_should_deregister() {
		let stream = Stream::spawn("test", plain(16, false));
		let subscription = stream.subscribe(0);
		let mut other = stream.subscribe(0);

		tokio::task::yield_now().await;
		drop(subscription);

		// The loop keeps serving the remaining subscriber.
		stream.publish(Event::new("still on")).await;

		assert_eq!(other.recv().await.unwrap().data, b"still on");
	}
}
