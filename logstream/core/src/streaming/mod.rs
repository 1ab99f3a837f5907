//! Per-Source Streaming
//!
//! Everything that happens between "a handler returned a byte stream" and
//! "lines and lifecycle events are on the shared output channel":
//!
//! - [`Backoff`] / [`ReconnectPolicy`]: the retry schedule
//! - [`extract_timestamp`]: splits a leading timestamp off each line
//! - the line reader: newline framing with a maximum line length
//! - the per-source reconnect loop

mod backoff;
mod emitter;
mod reader;
mod streamer;

pub use backoff::{Backoff, ReconnectPolicy};
pub use reader::extract_timestamp;

pub(crate) use emitter::Emitter;
pub(crate) use streamer::{SourceStreamer, StreamOutcome};
