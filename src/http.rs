//! HTTP adapter: serves one stream subscription as a `text/event-stream`
//! response.

// std
use std::{
	collections::HashMap,
	convert::Infallible,
	pin::Pin,
	task::{Context, Poll},
};
// crates.io
use axum::{
	body::Body,
	extract::{Query, State},
	http::{HeaderMap, StatusCode, header},
	response::{IntoResponse, Response},
};
use futures::Stream as StreamT;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::bytes::Bytes;
// self
use crate::{_prelude::*, server::Server, stream::DeregisterGuard};

/// Serve one SSE subscription over HTTP.
///
/// Mount it with the server as router state:
///
/// ```ignore
/// let app = Router::new().route("/events", get(event_handler)).with_state(server);
/// ```
///
/// The stream is selected with the `stream` query parameter; a reconnecting
/// client resumes from its `Last-Event-ID` header. Headers are flushed before
/// the first event so subscribing returns promptly, and the subscriber is
/// deregistered as soon as the peer goes away and the response body is
/// dropped.
pub async fn event_handler(
	State(server): State<Server>,
	Query(params): Query<HashMap<String, String>>,
	headers: HeaderMap,
) -> Response {
	let Some(stream_id) = params.get("stream").filter(|id| !id.is_empty()) else {
		return error_response("missing stream parameter");
	};
	let stream = match server.get_stream(stream_id) {
		Some(stream) => stream,
		None if server.auto_stream() => server.create_auto_stream(stream_id),
		None => return error_response("stream not found"),
	};
	let resume_id = headers
		.get("Last-Event-ID")
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.parse().ok())
		.unwrap_or(0);
	let (receiver, guard) = stream.subscribe(resume_id).into_parts();
	let frames = FrameStream {
		events: ReceiverStream::new(receiver),
		_guard: guard,
		split_data: server.split_data(),
	};
	let mut response = Response::builder()
		.header(header::CONTENT_TYPE, "text/event-stream")
		.header(header::CACHE_CONTROL, "no-cache")
		.header(header::CONNECTION, "keep-alive")
		.header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");

	for (name, value) in server.headers() {
		response = response.header(name.as_str(), value.as_str());
	}

	response
		.body(Body::from_stream(frames))
		.unwrap_or_else(|_| error_response("invalid response header"))
}

fn error_response(message: &str) -> Response {
	(StatusCode::INTERNAL_SERVER_ERROR, format!("{message}\n")).into_response()
}

/// Frames events from a subscriber queue into response-body bytes.
///
/// Dropping the body — hyper does so on client disconnect — releases the
/// guard, which deregisters the subscriber from the stream loop.
#[pin_project::pin_project]
struct FrameStream {
	#[pin]
	events: ReceiverStream<Arc<Event>>,
	_guard: DeregisterGuard,
	split_data: bool,
}
impl StreamT for FrameStream {
	type Item = Result<Bytes, Infallible>;

	fn poll_next(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Option<Self::Item>> {
		let mut this = self.project();

		loop {
			match Pin::new(&mut this.events).poll_next(ctx) {
				Poll::Ready(Some(event)) => match event.to_frame(*this.split_data) {
					Some(frame) => return Poll::Ready(Some(Ok(frame))),
					// Nothing to send for this event; keep draining.
					None => continue,
				},
				Poll::Ready(None) => return Poll::Ready(None),
				Poll::Pending => return Poll::Pending,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	// std
	use std::net::SocketAddr;
	// crates.io
	use axum::{Router, routing::get};
	use futures::StreamExt;
	use tokio::net::TcpListener;

	async fn serve(server: Server) -> SocketAddr {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let app = Router::new().route("/events", get(event_handler)).with_state(server);

		tokio::spawn(async move {
			axum::serve(listener, app).await.unwrap();
		});

		addr
	}

	async fn get_response(addr: SocketAddr, path: &str) -> reqwew::reqwest::Response {
		reqwew::reqwest::Client::new()
			.get(format!("http://{addr}{path}"))
			.send()
			.await
			.unwrap()
	}

	#[tokio::test]
	async fn missing_stream_parameter_should_500() {
		let addr = serve(Server::new()).await;

		assert_eq!(get_response(addr, "/events").await.status().as_u16(), 500);
	}

	#[tokio::test]
	async fn unknown_stream_should_500() {
		let addr = serve(Server::new()).await;

		assert_eq!(get_response(addr, "/events?stream=nope").await.status().as_u16(), 500);
	}

	#[tokio::test]
	async fn headers_should_be_flushed_before_first_event() {
		let server = Server::new().with_header("X-Accel-Buffering", "no");

		server.create_stream("test");

		let addr = serve(server).await;
		// No event has been published; the response head must arrive anyway.
		let response = get_response(addr, "/events?stream=test").await;

		assert_eq!(response.status().as_u16(), 200);
		assert_eq!(response.headers()["Content-Type"], "text/event-stream");
		assert_eq!(response.headers()["Cache-Control"], "no-cache");
		assert_eq!(response.headers()["Access-Control-Allow-Origin"], "*");
		assert_eq!(response.headers()["X-Accel-Buffering"], "no");
	}

	#[tokio::test]
	async fn events_should_arrive_framed() {
		let server = Server::new();

		server.create_stream("test");

		let addr = serve(server.clone()).await;
		let response = get_response(addr, "/events?stream=test").await;
		let mut body = response.bytes_stream();

		server.publish("test", Event::new("ping")).await;

		assert_eq!(&body.next().await.unwrap().unwrap()[..], &b"id: 0\ndata: ping\n\n"[..]);
	}

	#[tokio::test]
	async fn last_event_id_should_resume_replay() {
		let server = Server::new();

		server.create_stream("test");

		for i in 1..=3 {
			server.publish("test", Event::new(format!("test {i}"))).await;
		}

		// Let the stream loop log the publications before anyone connects.
		tokio::time::sleep(std::time::Duration::from_millis(50)).await;

		let addr = serve(server).await;
		let response = reqwew::reqwest::Client::new()
			.get(format!("http://{addr}/events?stream=test"))
			.header("Last-Event-ID", "2")
			.send()
			.await
			.unwrap();
		let mut body = response.bytes_stream();

		assert_eq!(&body.next().await.unwrap().unwrap()[..], &b"id: 2\ndata: test 3\n\n"[..]);
	}

	#[tokio::test]
	async fn comment_only_events_should_be_sent_but_never_logged() {
		let server = Server::new();

		server.create_stream("test");

		let addr = serve(server.clone()).await;
		let response = get_response(addr, "/events?stream=test").await;
		let mut body = response.bytes_stream();

		server.publish("test", Event::default().with_comment("keep-alive")).await;

		assert_eq!(&body.next().await.unwrap().unwrap()[..], &b": keep-alive\n\n"[..]);

		// A later subscriber replays the log, which never holds comments.
		let mut late = get_response(addr, "/events?stream=test").await.bytes_stream();

		server.publish("test", Event::new("real")).await;

		assert_eq!(&late.next().await.unwrap().unwrap()[..], &b"id: 0\ndata: real\n\n"[..]);
	}

	#[tokio::test]
	async fn auto_stream_should_be_created_on_subscribe() {
		let server = Server::new().with_auto_stream(true);
		let addr = serve(server.clone()).await;
		let response = get_response(addr, "/events?stream=t").await;

		assert_eq!(response.status().as_u16(), 200);
		assert!(server.stream_exists("t"));

		drop(response);

		// Disconnecting the only subscriber reclaims the stream.
		tokio::time::sleep(std::time::Duration::from_millis(100)).await;

		assert!(!server.stream_exists("t"));
	}
}
