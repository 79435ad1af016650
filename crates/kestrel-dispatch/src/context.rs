use std::path::PathBuf;

use kestrel_core::{Candidate, RequestOptions};
use kestrel_keys::{complete_position, CursorContext};

/// One completion request as seen by the dispatcher.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub filename: PathBuf,
    pub cursor: CursorContext,
    /// Byte column where the completed word starts.
    pub column: u32,
    pub source: Vec<String>,
    pub options: RequestOptions,
    /// Keep only candidates of these kinds. Empty keeps everything.
    pub kinds: Vec<String>,
    /// Run an uncached completion when no cache key can be derived.
    pub require_direct: bool,
}

impl RequestContext {
    /// Builds a request for the cursor at 1-based `line` and byte `column`.
    ///
    /// Columns past the end of the line, or inside a multi-byte character, are clamped
    /// back to the nearest boundary.
    pub fn at(filename: impl Into<PathBuf>, source: Vec<String>, line: usize, column: usize) -> Self {
        let text = line
            .checked_sub(1)
            .and_then(|idx| source.get(idx))
            .map(String::as_str)
            .unwrap_or("");
        let mut end = column.min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let input = &text[..end];
        let start = complete_position(input).min(input.len());

        Self {
            filename: filename.into(),
            cursor: CursorContext {
                input: input.to_owned(),
                line,
                complete_str: input.get(start..).unwrap_or("").to_owned(),
                cwd: std::env::current_dir().ok(),
            },
            column: start as u32,
            source,
            ..Default::default()
        }
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_kinds(mut self, kinds: Vec<String>) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn require_direct(mut self) -> Self {
        self.require_direct = true;
        self
    }

    pub(crate) fn retain_kinds(&self, candidates: &mut Vec<Candidate>) {
        if !self.kinds.is_empty() {
            candidates.retain(|candidate| self.kinds.iter().any(|kind| *kind == candidate.kind));
        }
    }
}
