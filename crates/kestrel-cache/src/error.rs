pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache persistence.
///
/// None of these reach a completion request: lookups degrade to a miss and failed writes
/// are logged.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {message}")]
    Json { message: String },

    #[error("incompatible cache format version: expected {expected}, found {found}")]
    IncompatibleFormatVersion { expected: u32, found: u32 },

    #[error("module name {module:?} cannot be used as a cache file name")]
    InvalidModuleName { module: String },
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        // Cached candidates carry user paths and docstrings; don't echo string values.
        let message = sanitize_json_error_message(&err.to_string());
        Self::Json { message }
    }
}

fn sanitize_json_error_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];

        let bytes = rest.as_bytes();
        let mut end = None;
        for (idx, &b) in bytes.iter().enumerate() {
            if b != b'"' {
                continue;
            }
            let backslashes = bytes[..idx].iter().rev().take_while(|&&c| c == b'\\').count();
            if backslashes % 2 == 0 {
                end = Some(idx);
                break;
            }
        }

        let Some(end) = end else {
            out.push_str("<redacted>");
            rest = "";
            break;
        };
        out.push_str("<redacted>\"");
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}
