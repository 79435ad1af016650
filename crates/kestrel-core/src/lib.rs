//! Core shared types for Kestrel.
//!
//! This crate is intentionally small: it holds the vocabulary every other crate speaks
//! (cache keys, completion candidates, per-request options) plus a couple of clock and
//! filesystem helpers that need to behave identically everywhere.

mod candidate;
mod key;
mod time;

pub use candidate::{Candidate, RequestOptions, SyntheticSource};
pub use key::{CacheKey, KeyCategory};
pub use time::{file_mtime_millis, now_millis};

/// Crate version stamped into on-disk cache files and the wire handshake.
pub const KESTREL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Best-effort conversion of a panic payload into a printable message.
pub fn panic_payload_to_str(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
