//! SSE client: subscription, event parsing and reconnection.

// std
use std::{
	collections::HashMap,
	io,
	sync::{Mutex, MutexGuard},
	time::Duration,
};
// crates.io
use futures::{StreamExt, TryStreamExt};
use reqwew::reqwest::{Client as HttpClient, Method, Response, StatusCode, header};
use tokio::sync::mpsc;
use tokio_util::{codec::FramedRead, io::StreamReader, sync::CancellationToken};
// self
use crate::{_prelude::*, codec::EventBlockDecoder};

/// Reconnection policy for a subscription.
///
/// The interval before each attempt doubles after every consecutive failure,
/// up to `max_interval`, and resets once a connection is established.
#[derive(Clone, Debug)]
pub struct Reconnect {
	/// Maximum number of consecutive attempts; [`None`] retries forever.
	pub max_retries: Option<usize>,
	/// Interval before the first attempt.
	pub initial_interval: Duration,
	/// Upper bound for the backoff interval.
	pub max_interval: Duration,
}
impl Default for Reconnect {
	fn default() -> Self {
		Self {
			max_retries: None,
			initial_interval: Duration::from_millis(200),
			max_interval: Duration::from_secs(30),
		}
	}
}

struct Backoff {
	policy: Reconnect,
	attempt: usize,
	interval: Duration,
}
impl Backoff {
	fn new(policy: Reconnect) -> Self {
		let interval = policy.initial_interval;

		Self { policy, attempt: 0, interval }
	}

	/// Sleep before the next attempt; `false` once the policy is exhausted.
	async fn wait(&mut self) -> bool {
		if self.policy.max_retries.is_some_and(|max| self.attempt >= max) {
			return false;
		}

		self.attempt += 1;

		tokio::time::sleep(self.interval).await;

		self.interval = (self.interval * 2).min(self.policy.max_interval);

		true
	}

	fn reset(&mut self) {
		self.attempt = 0;
		self.interval = self.policy.initial_interval;
	}
}

/// Where a read loop hands its parsed events.
enum Sink<'a> {
	Handler(&'a mut (dyn FnMut(Event) + Send)),
	Channel(mpsc::Sender<Event>),
}
impl Sink<'_> {
	/// Deliver one event; `false` when the subscription should stop.
	///
	/// Channel delivery checks the cancellation signal before and while
	/// blocked on the send, so unsubscribing never waits for a consumer.
	async fn deliver(&mut self, cancel: &CancellationToken, event: Event) -> bool {
		match self {
			Self::Handler(handler) => {
				handler(event);

				true
			},
			Self::Channel(sender) => {
				if cancel.is_cancelled() {
					return false;
				}

				tokio::select! {
					_ = cancel.cancelled() => false,
					result = sender.send(event) => result.is_ok(),
				}
			},
		}
	}
}

struct ChannelSubscription {
	sender: mpsc::Sender<Event>,
	cancel: CancellationToken,
}

enum Connection {
	Eof,
	Cancelled,
}

/// SSE client for one remote endpoint.
///
/// A client runs one `subscribe*` call at a time; concurrent subscriptions on
/// the same client are not supported (they would fight over the resume id).
/// Cloning is cheap and clones share the resume id and the subscription
/// registry.
#[derive(Clone)]
pub struct Client {
	url: String,
	http: HttpClient,
	headers: Vec<(String, String)>,
	decode_base64: bool,
	reconnect: Reconnect,
	max_buffer_size: usize,
	last_event_id: Arc<Mutex<Vec<u8>>>,
	retry_hint: Arc<Mutex<Option<Duration>>>,
	on_connect: Option<Arc<dyn Fn() + Send + Sync>>,
	on_disconnect: Option<Arc<dyn Fn() + Send + Sync>>,
	subscriptions: Arc<Mutex<Vec<ChannelSubscription>>>,
}
impl Client {
	/// Create a client for the given endpoint.
	pub fn new(url: impl Into<String>) -> Self {
		let http =
			HttpClient::builder().user_agent("sse-hub").build().expect("build must succeed; qed");

		Self {
			url: url.into(),
			http,
			headers: Vec::new(),
			decode_base64: false,
			reconnect: Reconnect::default(),
			max_buffer_size: crate::codec::DEFAULT_MAX_BLOCK_SIZE,
			last_event_id: Arc::new(Mutex::new(Vec::new())),
			retry_hint: Arc::new(Mutex::new(None)),
			on_connect: None,
			on_disconnect: None,
			subscriptions: Arc::new(Mutex::new(Vec::new())),
		}
	}

	/// Add a header to every request.
	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.push((name.into(), value.into()));

		self
	}

	/// Add a set of headers to every request.
	pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
		self.headers.extend(headers);

		self
	}

	/// Base64-decode payloads; the server must be encoding them.
	pub fn with_base64(mut self, decode_base64: bool) -> Self {
		self.decode_base64 = decode_base64;

		self
	}

	/// Set the reconnection policy.
	pub fn with_reconnect(mut self, reconnect: Reconnect) -> Self {
		self.reconnect = reconnect;

		self
	}

	/// Cap the size of a single incoming event block.
	pub fn with_max_buffer_size(mut self, max_buffer_size: usize) -> Self {
		self.max_buffer_size = max_buffer_size;

		self
	}

	/// Run `callback` every time a connection is established, including after
	/// a reconnect.
	pub fn with_on_connect(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
		self.on_connect = Some(Arc::new(callback));

		self
	}

	/// Run `callback` every time an established connection is lost.
	pub fn with_on_disconnect(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
		self.on_disconnect = Some(Arc::new(callback));

		self
	}

	/// Last event id observed by this client, sent as `Last-Event-ID` on
	/// reconnect.
	pub fn last_event_id(&self) -> Vec<u8> {
		self.lock_last_event_id().clone()
	}

	/// Last `retry:` hint announced by the server.
	///
	/// Recorded for callers; the backoff schedule does not consume it.
	pub fn retry_hint(&self) -> Option<Duration> {
		*self.lock(&self.retry_hint)
	}

	/// Subscribe to a named stream, invoking `handler` for every event.
	///
	/// Runs until the connection fails terminally or the reconnect policy is
	/// exhausted; dropping the future aborts the in-flight read.
	pub async fn subscribe<F>(&self, stream: &str, handler: F) -> Result<()>
	where
		F: FnMut(Event) + Send,
	{
		self.subscribe_inner(Some(stream), handler).await
	}

	/// Like [`subscribe`](Self::subscribe), for endpoints that stream without
	/// a `stream` selector.
	pub async fn subscribe_raw<F>(&self, handler: F) -> Result<()>
	where
		F: FnMut(Event) + Send,
	{
		self.subscribe_inner(None, handler).await
	}

	/// Subscribe to a named stream, feeding events into `sender`.
	///
	/// Returns once the first connection is established; the feed then runs
	/// in a background task until [`unsubscribe`](Self::unsubscribe) or a
	/// terminal error.
	pub async fn subscribe_chan(&self, stream: &str, sender: mpsc::Sender<Event>) -> Result<()> {
		self.subscribe_chan_inner(Some(stream), sender).await
	}

	/// Like [`subscribe_chan`](Self::subscribe_chan), without the `stream`
	/// selector.
	pub async fn subscribe_raw_chan(&self, sender: mpsc::Sender<Event>) -> Result<()> {
		self.subscribe_chan_inner(None, sender).await
	}

	/// Stop the channel subscription feeding `sender`.
	///
	/// Idempotent: safe to call repeatedly, concurrently, or for channels
	/// that were never subscribed.
	pub fn unsubscribe(&self, sender: &mpsc::Sender<Event>) {
		for subscription in
			self.lock(&self.subscriptions).iter().filter(|s| s.sender.same_channel(sender))
		{
			subscription.cancel.cancel();
		}
	}

	async fn subscribe_inner<F>(&self, stream: Option<&str>, mut handler: F) -> Result<()>
	where
		F: FnMut(Event) + Send,
	{
		let cancel = CancellationToken::new();
		let mut sink = Sink::Handler(&mut handler);

		self.run_loop(stream, &cancel, &mut sink, None).await
	}

	async fn subscribe_chan_inner(
		&self,
		stream: Option<&str>,
		sender: mpsc::Sender<Event>,
	) -> Result<()> {
		let cancel = CancellationToken::new();

		self.lock(&self.subscriptions)
			.push(ChannelSubscription { sender: sender.clone(), cancel: cancel.clone() });

		// The first connection happens inline so failures surface to the
		// caller instead of dying inside a detached task.
		let mut backoff = Backoff::new(self.reconnect.clone());
		let response = loop {
			match self.connect(stream).await {
				Ok(response) => break response,
				Err(e) if e.is_retryable() =>
					if !backoff.wait().await {
						self.remove_subscription(&sender);

						return Err(Error::MaxRetriesReached(backoff.attempt));
					},
				Err(e) => {
					self.remove_subscription(&sender);

					return Err(e);
				},
			}
		};
		let this = self.clone();
		let stream = stream.map(str::to_owned);

		tokio::spawn(async move {
			let mut sink = Sink::Channel(sender.clone());

			if let Err(e) =
				this.run_loop(stream.as_deref(), &cancel, &mut sink, Some(response)).await
			{
				tracing::warn!("subscription ended: {e}");
			}

			this.remove_subscription(&sender);
		});

		Ok(())
	}

	async fn run_loop(
		&self,
		stream: Option<&str>,
		cancel: &CancellationToken,
		sink: &mut Sink<'_>,
		mut pending: Option<Response>,
	) -> Result<()> {
		let mut backoff = Backoff::new(self.reconnect.clone());

		loop {
			if cancel.is_cancelled() {
				return Ok(());
			}

			let outcome = match pending.take() {
				Some(response) => {
					backoff.reset();

					self.consume(response, cancel, sink).await
				},
				None => {
					let connected = tokio::select! {
						_ = cancel.cancelled() => return Ok(()),
						connected = self.connect(stream) => connected,
					};

					match connected {
						Ok(response) => {
							backoff.reset();

							self.consume(response, cancel, sink).await
						},
						Err(e) => Err(e),
					}
				},
			};

			match outcome {
				Ok(Connection::Cancelled) => return Ok(()),
				// Benign end of stream: reconnect under the backoff policy.
				Ok(Connection::Eof) => (),
				Err(e) if e.is_retryable() => {
					tracing::debug!("connection lost: {e}");

					if let Some(callback) = &self.on_disconnect {
						callback();
					}
				},
				Err(e) => return Err(e),
			}

			let retry = tokio::select! {
				_ = cancel.cancelled() => return Ok(()),
				retry = backoff.wait() => retry,
			};

			if !retry {
				return Err(Error::MaxRetriesReached(backoff.attempt));
			}
		}
	}

	async fn connect(&self, stream: Option<&str>) -> Result<Response> {
		let mut request = self
			.http
			.request(Method::GET, &self.url)
			.header(header::ACCEPT, "text/event-stream")
			.header(header::CACHE_CONTROL, "no-cache")
			.header(header::CONNECTION, "keep-alive");

		if let Some(stream) = stream {
			request = request.query(&[("stream", stream)]);
		}

		let last_event_id = self.last_event_id();

		if !last_event_id.is_empty() {
			request = request.header("Last-Event-ID", last_event_id);
		}
		for (name, value) in &self.headers {
			request = request.header(name.as_str(), value.as_str());
		}

		let response = self.http.execute(request.build()?).await?;

		if response.status() != StatusCode::OK {
			return Err(Error::InvalidStatusCode(response.status().as_u16()));
		}

		tracing::debug!("connected to {}", self.url);

		if let Some(callback) = &self.on_connect {
			callback();
		}

		Ok(response)
	}

	async fn consume(
		&self,
		response: Response,
		cancel: &CancellationToken,
		sink: &mut Sink<'_>,
	) -> Result<Connection> {
		let reader = StreamReader::new(response.bytes_stream().map_err(io::Error::other));
		let decoder = EventBlockDecoder::new(self.max_buffer_size);
		let capacity = decoder.initial_capacity();
		let mut blocks = FramedRead::with_capacity(reader, decoder, capacity);

		loop {
			let block = tokio::select! {
				_ = cancel.cancelled() => return Ok(Connection::Cancelled),
				block = blocks.next() => block,
			};

			match block {
				Some(Ok(block)) => {
					let mut event = Event::from_block(&block, self.decode_base64);

					// Comment-only and blank blocks carry nothing to deliver.
					if !event.has_content() {
						continue;
					}

					self.note_retry_hint(&event);

					if event.id.is_empty() {
						event.id = self.last_event_id();
					} else {
						*self.lock_last_event_id() = event.id.clone();
					}
					if !sink.deliver(cancel, event).await {
						return Ok(Connection::Cancelled);
					}
				},
				Some(Err(e)) => return Err(e),
				None => return Ok(Connection::Eof),
			}
		}
	}

	fn note_retry_hint(&self, event: &Event) {
		if event.retry.is_empty() {
			return;
		}
		if let Some(ms) =
			std::str::from_utf8(&event.retry).ok().and_then(|s| s.parse::<u64>().ok())
		{
			*self.lock(&self.retry_hint) = Some(Duration::from_millis(ms));
		}
	}

	fn remove_subscription(&self, sender: &mpsc::Sender<Event>) {
		self.lock(&self.subscriptions).retain(|s| !s.sender.same_channel(sender));
	}

	fn lock_last_event_id(&self) -> MutexGuard<'_, Vec<u8>> {
		self.lock(&self.last_event_id)
	}

	fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
		mutex.lock().expect("client state must not be poisoned; qed")
	}
}
