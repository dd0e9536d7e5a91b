//! SSE event record, wire framing and event-block parsing.

// std
use std::time::Instant;
// crates.io
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::Serialize;
use tokio_util::bytes::{BufMut, Bytes, BytesMut};
// self
use crate::_prelude::*;

/// A single server-sent event.
///
/// Fields are kept as raw bytes; the wire form is produced by
/// [`to_frame`](Self::to_frame) and recovered by
/// [`from_block`](Self::from_block).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Event {
	/// Event identifier. Assigned by the stream's log on publish; any value
	/// supplied by a publisher is overwritten there.
	pub id: Vec<u8>,
	/// Event type tag.
	pub event: Vec<u8>,
	/// Payload. May contain embedded newlines, which are split into multiple
	/// `data:` lines on emission and rejoined on reception.
	pub data: Vec<u8>,
	/// Reconnect-delay hint forwarded to clients, in milliseconds.
	pub retry: Vec<u8>,
	/// Comment, transmitted as a leading `:`-prefixed line. Comment-only
	/// events are sent to live subscribers but never logged.
	pub comment: Vec<u8>,
	/// Set when the event is inserted into an event log.
	pub timestamp: Option<Instant>,
}
impl Event {
	/// Create an event carrying the given payload.
	pub fn new(data: impl Into<Vec<u8>>) -> Self {
		Self { data: data.into(), ..Default::default() }
	}

	/// Create an event whose payload is the JSON encoding of `value`.
	pub fn json<S>(value: &S) -> Result<Self>
	where
		S: Serialize,
	{
		Ok(Self::new(serde_json::to_vec(value)?))
	}

	/// Set the event type tag.
	pub fn with_event(mut self, event: impl Into<Vec<u8>>) -> Self {
		self.event = event.into();

		self
	}

	/// Set the event identifier.
	pub fn with_id(mut self, id: impl Into<Vec<u8>>) -> Self {
		self.id = id.into();

		self
	}

	/// Set the reconnect-delay hint.
	pub fn with_retry(mut self, retry: impl Into<Vec<u8>>) -> Self {
		self.retry = retry.into();

		self
	}

	/// Set the comment line.
	pub fn with_comment(mut self, comment: impl Into<Vec<u8>>) -> Self {
		self.comment = comment.into();

		self
	}

	/// Whether the event carries anything worth storing in an event log.
	pub fn has_content(&self) -> bool {
		!(self.id.is_empty()
			&& self.data.is_empty()
			&& self.event.is_empty()
			&& self.retry.is_empty())
	}

	/// Replace the payload with its base64 encoding.
	pub fn encode_base64(&mut self) {
		if !self.data.is_empty() {
			self.data = BASE64.encode(&self.data).into_bytes();
		}
	}

	/// Encode the event into its wire frame.
	///
	/// Comment lines come first. Payload-carrying events are written as
	/// `id:`, `data:` (one line per payload fragment when `split_data`),
	/// `event:` and `retry:` lines, each LF-terminated, followed by a blank
	/// line. Returns [`None`] for events with neither payload nor comment:
	/// those produce no frame at all.
	pub fn to_frame(&self, split_data: bool) -> Option<Bytes> {
		if self.data.is_empty() && self.comment.is_empty() {
			return None;
		}

		let mut buf = BytesMut::with_capacity(
			self.id.len()
				+ self.event.len()
				+ self.data.len()
				+ self.retry.len()
				+ self.comment.len()
				+ 64,
		);

		if !self.comment.is_empty() {
			buf.put_slice(b": ");
			buf.put_slice(&self.comment);
			buf.put_u8(b'\n');
		}
		if !self.data.is_empty() {
			buf.put_slice(b"id: ");
			buf.put_slice(&self.id);
			buf.put_u8(b'\n');

			if split_data {
				for line in self.data.split(|&b| b == b'\n') {
					if line.is_empty() {
						buf.put_slice(b"data:\n");
					} else {
						buf.put_slice(b"data: ");
						buf.put_slice(line);
						buf.put_u8(b'\n');
					}
				}
			} else {
				buf.put_slice(b"data: ");
				buf.put_slice(&self.data);
				buf.put_u8(b'\n');
			}
			if !self.event.is_empty() {
				buf.put_slice(b"event: ");
				buf.put_slice(&self.event);
				buf.put_u8(b'\n');
			}
			if !self.retry.is_empty() {
				buf.put_slice(b"retry: ");
				buf.put_slice(&self.retry);
				buf.put_u8(b'\n');
			}
		}

		buf.put_u8(b'\n');

		Some(buf.freeze())
	}

	/// Parse one event block into an event.
	///
	/// Repeated `data:` lines concatenate with `\n` separators; a line that is
	/// exactly `data` contributes an empty payload line; comment and unknown
	/// lines are ignored. With `decode_base64`, a malformed payload is
	/// reported and the raw bytes are delivered unchanged.
	pub fn from_block(block: &[u8], decode_base64: bool) -> Self {
		let canonical = canonicalize(block);
		let mut ev = Self::default();

		for line in canonical.split(|&b| b == b'\n' || b == b'\r') {
			if let Some(rest) = line.strip_prefix(b"id:".as_slice()) {
				ev.id = trim_field(rest).to_vec();
			} else if line == b"data" {
				ev.data.push(b'\n');
			} else if let Some(rest) = line.strip_prefix(b"data:".as_slice()) {
				ev.data.extend_from_slice(trim_field(rest));
				ev.data.push(b'\n');
			} else if let Some(rest) = line.strip_prefix(b"event:".as_slice()) {
				ev.event = trim_field(rest).to_vec();
			} else if let Some(rest) = line.strip_prefix(b"retry:".as_slice()) {
				ev.retry = trim_field(rest).to_vec();
			}
		}

		if ev.data.last() == Some(&b'\n') {
			ev.data.pop();
		}
		if decode_base64 && !ev.data.is_empty() {
			match BASE64.decode(&ev.data) {
				Ok(decoded) => ev.data = decoded,
				Err(e) => tracing::warn!("undecodable base64 payload: {e}"),
			}
		}

		ev
	}
}

/// Replace every `\n\r` with a single `\n`.
fn canonicalize(block: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(block.len());
	let mut i = 0;

	while i < block.len() {
		if block[i] == b'\n' && block.get(i + 1) == Some(&b'\r') {
			out.push(b'\n');

			i += 2;
		} else {
			out.push(block[i]);

			i += 1;
		}
	}

	out
}

/// Strip at most one leading space and one trailing LF.
fn trim_field(mut rest: &[u8]) -> &[u8] {
	if rest.first() == Some(&b' ') {
		rest = &rest[1..];
	}
	if rest.last() == Some(&b'\n') {
		rest = &rest[..rest.len() - 1];
	}

	rest
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn frame_layout_should_work() {
		let frame = Event::new("hello").with_id("3").with_event("greeting").with_retry("250");

		assert_eq!(
			frame.to_frame(true).unwrap(),
			Bytes::from_static(b"id: 3\ndata: hello\nevent: greeting\nretry: 250\n\n"),
		);
	}

	#[test]
	fn multiline_data_should_split() {
		let frame = Event::new("line1\nline2\nline3").with_id("0").to_frame(true).unwrap();

		assert_eq!(frame, Bytes::from_static(b"id: 0\ndata: line1\ndata: line2\ndata: line3\n\n"));

		let joined = frame.strip_suffix(b"\n\n").unwrap();

		assert_eq!(Event::from_block(joined, false).data, b"line1\nline2\nline3");
	}

	#[test]
	fn empty_fragment_should_emit_bare_data_line() {
		let frame = Event::new("a\n\nb").with_id("1").to_frame(true).unwrap();

		assert_eq!(frame, Bytes::from_static(b"id: 1\ndata: a\ndata:\ndata: b\n\n"));
	}

	#[test]
	fn unsplit_data_should_stay_single_line() {
		let frame = Event::new("a\nb").with_id("1").to_frame(false).unwrap();

		assert_eq!(frame, Bytes::from_static(b"id: 1\ndata: a\nb\n\n"));
	}

	#[test]
	fn empty_event_should_produce_no_frame() {
		assert_eq!(Event::default().with_id("5").to_frame(true), None);
	}

	#[test]
	fn comment_only_event_should_frame_as_comment() {
		let frame = Event::default().with_comment("keep-alive").to_frame(true).unwrap();

		assert_eq!(frame, Bytes::from_static(b": keep-alive\n\n"));
		assert!(!Event::default().with_comment("keep-alive").has_content());
	}

	#[test]
	fn block_parsing_should_work() {
		let ev = Event::from_block(b"id: 7\ndata: ping\nevent: beat\nretry: 100", false);

		assert_eq!(ev.id, b"7");
		assert_eq!(ev.data, b"ping");
		assert_eq!(ev.event, b"beat");
		assert_eq!(ev.retry, b"100");
	}

	#[test]
	fn trim_should_strip_one_space_only() {
		assert_eq!(Event::from_block(b"data:  padded", false).data, b" padded");
		assert_eq!(Event::from_block(b"data:tight", false).data, b"tight");
	}

	#[test]
	fn bare_data_line_should_append_empty_line() {
		assert_eq!(Event::from_block(b"data: a\ndata\ndata: b", false).data, b"a\n\nb");
	}

	#[test]
	fn comments_and_unknown_fields_should_be_ignored() {
		let ev = Event::from_block(b": comment\nwhatever: x\ndata: ok", false);

		assert_eq!(ev.data, b"ok");
		assert!(ev.event.is_empty());
	}

	#[test]
	fn swapped_crlf_should_canonicalize() {
		let ev = Event::from_block(b"id: 1\n\rdata: x", false);

		assert_eq!(ev.id, b"1");
		assert_eq!(ev.data, b"x");
	}

	#[test]
	fn base64_roundtrip_should_work() {
		let mut ev = Event::new([0_u8, 159, 146, 150].as_slice());

		ev.encode_base64();

		let frame = ev.to_frame(true).unwrap();
		let block = frame.strip_suffix(b"\n\n").unwrap();

		assert_eq!(Event::from_block(block, true).data, [0, 159, 146, 150]);
	}

	#[test]
	fn malformed_base64_should_deliver_raw() {
		assert_eq!(Event::from_block(b"data: @@not-base64@@", true).data, b"@@not-base64@@");
	}

	#[test]
	fn json_payload_should_work() {
		let ev = Event::json(&serde_json::json!({ "n": 1 })).unwrap();

		assert_eq!(ev.data, br#"{"n":1}"#);
	}
}
