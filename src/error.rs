#![allow(missing_docs)]

// std
use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] io::Error),

	#[error(transparent)]
	Http(#[from] reqwew::reqwest::Error),
	#[error(transparent)]
	Json(#[from] serde_json::Error),

	#[error("unexpected response status {0}")]
	InvalidStatusCode(u16),
	#[error("event block of {size} bytes exceeds the {max} byte limit")]
	EventTooLarge { size: usize, max: usize },
	#[error("reconnect attempts exhausted after {0} tries")]
	MaxRetriesReached(usize),
}
impl Error {
	/// Whether a fresh connection attempt may still succeed.
	///
	/// Transport failures are retryable under the reconnect policy; an
	/// oversized event block or an exhausted policy is terminal.
	pub fn is_retryable(&self) -> bool {
		matches!(self, Self::Io(_) | Self::Http(_) | Self::InvalidStatusCode(_))
	}
}
