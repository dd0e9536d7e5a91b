//! Server-Sent Events hub and client.
//!
//! The server half multiplexes any number of HTTP readers over named streams,
//! with bounded replay logs and per-stream fan-out loops. The client half
//! consumes a remote `text/event-stream` endpoint, reassembling event blocks
//! and reconnecting with exponential backoff.

#![deny(clippy::all, missing_docs)]
#![cfg_attr(not(test), deny(unused_crate_dependencies))]

pub mod client;
pub mod codec;
pub mod error;
pub mod event;
pub mod http;
pub mod log;
pub mod server;
pub mod stream;

pub mod prelude {
	#![allow(missing_docs)]

	pub use crate::{client::*, codec::*, error::*, event::*, http::*, log::*, server::*, stream::*};
}

mod _prelude {
	pub use std::sync::Arc;

	pub(crate) use crate::{error::*, event::Event};
}
