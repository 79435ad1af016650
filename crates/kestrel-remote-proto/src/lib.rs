//! Wire protocol between a Kestrel client and its backend process.
//!
//! Frames are a little-endian `u32` payload length followed by a bincode payload. The
//! backend speaks first with a [`Handshake`]; afterwards every [`CompletionRequest`] is
//! answered by exactly one [`BackendMessage::Completions`]. Closing the backend's stdin
//! (clean EOF before a length prefix) asks it to exit.

use std::path::PathBuf;

use kestrel_core::{CacheKey, Candidate, RequestOptions};
use serde::{Deserialize, Serialize};

pub mod transport;

pub use transport::{read_message, write_message, ProtocolError};

/// Bumped whenever a wire type changes shape.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum size of a single payload (not including the 4-byte length prefix).
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024; // 64 MiB

/// Identifies the analysis engine running inside a backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineVersion {
    pub name: String,
    pub version: String,
}

impl std::fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

/// First frame written by a backend after it starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol_version: u32,
    pub engine: EngineVersion,
}

impl Handshake {
    pub fn new(engine: EngineVersion) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            engine,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub cache_key: CacheKey,
    /// Dependency files of the key; the backend does not stat them but may log them.
    pub dependencies: Vec<PathBuf>,
    pub source: String,
    /// 1-based line.
    pub line: u32,
    /// 0-based byte column.
    pub column: u32,
    pub filename: Option<PathBuf>,
    pub options: Option<RequestOptions>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendMessage {
    Handshake(Handshake),
    /// `None` means the engine failed for this request; an empty list means it succeeded
    /// with no candidates.
    Completions(Option<Vec<Candidate>>),
}
