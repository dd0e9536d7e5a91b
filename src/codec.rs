//! Incremental tokenizer for `text/event-stream` byte streams.

// crates.io
use tokio_util::{
	bytes::{Bytes, BytesMut},
	codec::Decoder,
};
// self
use crate::_prelude::*;

/// Default cap on the size of a single event block.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 512 * 1024;
/// Read-buffer capacity hint; the effective initial capacity is
/// `min(INITIAL_BUFFER_SIZE, max block size)`.
pub const INITIAL_BUFFER_SIZE: usize = 4096;

/// Splits a byte stream into SSE event blocks.
///
/// A block ends at the earliest occurrence of any double-newline terminator
/// (`\n\n`, `\r\r`, `\r\n\n`, `\n\r\n`, `\r\n\r\n`); when several start at the
/// same offset the longest wins, so `\r\n\r\n` is consumed whole. The emitted
/// block excludes the terminator.
///
/// Scanning resumes three bytes before the previous high-water mark (three
/// bytes of look-behind covers the longest terminator prefix `\r\n\r`), which
/// keeps total scanning work linear in the block size however the input is
/// chunked.
#[derive(Clone, Debug)]
pub struct EventBlockDecoder {
	max_length: usize,
	scanned: usize,
	#[cfg(test)]
	compared: usize,
}
impl EventBlockDecoder {
	/// Create a decoder that rejects blocks larger than `max_length`.
	pub fn new(max_length: usize) -> Self {
		Self {
			max_length,
			scanned: 0,
			#[cfg(test)]
			compared: 0,
		}
	}

	/// The largest block this decoder will accept.
	pub fn max_length(&self) -> usize {
		self.max_length
	}

	/// Suggested capacity for the read buffer feeding this decoder.
	pub fn initial_capacity(&self) -> usize {
		self.max_length.min(INITIAL_BUFFER_SIZE)
	}

	/// Offset and length of the first block terminator, if any.
	fn find_terminator(&mut self, src: &[u8]) -> Option<(usize, usize)> {
		let start = self.scanned.saturating_sub(3);

		for i in start..src.len() {
			#[cfg(test)]
			{
				self.compared += 1;
			}

			match src[i] {
				b'\r' =>
					if src[i + 1..].starts_with(b"\n\r\n") {
						return Some((i, 4));
					} else if src[i + 1..].starts_with(b"\n\n") {
						return Some((i, 3));
					} else if src.get(i + 1) == Some(&b'\r') {
						return Some((i, 2));
					},
				b'\n' =>
					if src[i + 1..].starts_with(b"\r\n") {
						return Some((i, 3));
					} else if src.get(i + 1) == Some(&b'\n') {
						return Some((i, 2));
					},
				_ => (),
			}
		}

		self.scanned = src.len();

		None
	}
}
impl Default for EventBlockDecoder {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_BLOCK_SIZE)
	}
}
impl Decoder for EventBlockDecoder {
	type Error = Error;
	type Item = Bytes;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
		if let Some((at, term_len)) = self.find_terminator(src) {
			let block = src.split_to(at).freeze();
			let _ = src.split_to(term_len);

			self.scanned = 0;

			return Ok(Some(block));
		}
		if src.len() > self.max_length {
			return Err(Error::EventTooLarge { size: src.len(), max: self.max_length });
		}

		Ok(None)
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
		match self.decode(src)? {
			Some(block) => Ok(Some(block)),
			None if src.is_empty() => Ok(None),
			// Trailing bytes with no terminator form one final block.
			None => {
				self.scanned = 0;

				Ok(Some(src.split_to(src.len()).freeze()))
			},
		}
	}
}
