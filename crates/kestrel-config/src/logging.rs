use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Once};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriter, MakeWriterExt};
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Logging level for all Kestrel crates.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    /// Mirror logs to stderr.
    ///
    /// The backend process disables this: its stdio is owned by the wire protocol.
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to the given file path.
    ///
    /// If the file cannot be opened, file logging is disabled while other sinks
    /// remain active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            // Anything else is treated as an `EnvFilter` directive string.
            _ => trimmed.to_owned(),
        }
    }

    fn filter_from(directives: &str) -> Option<tracing_subscriber::EnvFilter> {
        tracing_subscriber::EnvFilter::try_new(directives).ok()
    }

    /// The effective filter: the configured `level` (a level name or full directive
    /// string), extended by `RUST_LOG` when that is set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let configured = Self::normalize_level_directives(&self.level);
        let from_env = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let merged = from_env.and_then(|env| {
            Self::filter_from(&format!("{configured},{env}")).or_else(|| Self::filter_from(&env))
        });
        merged
            .or_else(|| Self::filter_from(&configured))
            .unwrap_or_else(|| {
                tracing_subscriber::EnvFilter::default()
                    .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
            })
    }

    fn open_file(&self) -> Option<std::fs::File> {
        let path = self.file.as_ref()?;
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            let _ = std::fs::create_dir_all(dir);
        }
        std::fs::OpenOptions::new().create(true).append(true).open(path).ok()
    }

    fn make_writer(&self, file: Option<std::fs::File>) -> BoxMakeWriter {
        let mut writer = BoxMakeWriter::new(io::sink);
        if self.stderr {
            // Test builds route through the capture-aware writer.
            writer = if cfg!(debug_assertions) {
                BoxMakeWriter::new(writer.and(tracing_subscriber::fmt::writer::TestWriter::with_stderr))
            } else {
                BoxMakeWriter::new(writer.and(io::stderr))
            };
        }
        if let Some(file) = file {
            writer = BoxMakeWriter::new(writer.and(SharedFile(Arc::new(Mutex::new(file)))));
        }
        writer
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

/// Append-only log file shared by every event writer.
struct SharedFile(Arc<Mutex<std::fs::File>>);

struct SharedFileGuard<'a>(MutexGuard<'a, std::fs::File>);

impl<'a> MakeWriter<'a> for SharedFile {
    type Writer = SharedFileGuard<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileGuard(self.0.lock())
    }
}

impl Write for SharedFileGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

static TRACING_INIT: Once = Once::new();

/// Installs the global `tracing` subscriber described by `config`.
///
/// Only the first call in a process has an effect.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let file = config.open_file();
        let file_failed = config.file.is_some() && file.is_none();
        let writer = config.make_writer(file);

        let fmt = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);
        let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if config.json {
            fmt.json().boxed()
        } else {
            fmt.boxed()
        };

        let installed = tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(config.env_filter()).with(layer),
        )
        .is_ok();
        if installed && file_failed {
            if let Some(path) = &config.file {
                tracing::warn!(
                    target: "kestrel.config",
                    path = %path.display(),
                    "cannot open log file; logging to the remaining sinks"
                );
            }
        }
    });
}
