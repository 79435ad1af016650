//! Configuration and logging setup for Kestrel.
//!
//! Configuration is a single TOML document; every table and field is optional and falls
//! back to the defaults documented on each struct. Example:
//!
//! ```toml
//! [backend]
//! python_path = "/usr/bin/python3"
//! max_completions = 50
//!
//! [workers]
//! count = 2
//! job_timeout_ms = 10000
//!
//! [cache]
//! persist = true
//! reap_interval_secs = 300
//! max_age_secs = 300
//!
//! [dispatch]
//! wait_ms = 50
//!
//! [logging]
//! level = "debug"
//! ```

mod logging;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use logging::{init_tracing, LoggingConfig};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KestrelConfig {
    /// How backend processes are spawned.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Worker pool sizing and per-job budget.
    #[serde(default)]
    pub workers: WorkersConfig,

    /// In-memory cache policy and on-disk persistence.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Request dispatch behaviour.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Global logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Backend server executable. Defaults to `kestrel-backend` next to the current executable.
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Interpreter whose environment the engine analyses. `VIRTUAL_ENV` takes precedence.
    #[serde(default)]
    pub python_path: Option<PathBuf>,

    /// Engine library directories, appended to the backend's `PYTHONPATH`.
    #[serde(default)]
    pub engine_path: Vec<PathBuf>,

    /// Completions served by one backend process before it is proactively restarted.
    #[serde(default = "BackendConfig::default_max_completions")]
    pub max_completions: u32,

    /// How long a freshly spawned backend may take to send its handshake frame.
    #[serde(default = "BackendConfig::default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Upper bound for interpreter probes (`python -V`, `sys.path`).
    #[serde(default = "BackendConfig::default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl BackendConfig {
    fn default_max_completions() -> u32 {
        50
    }

    fn default_handshake_timeout_ms() -> u64 {
        10_000
    }

    fn default_probe_timeout_ms() -> u64 {
        5_000
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: None,
            python_path: None,
            engine_path: Vec::new(),
            max_completions: Self::default_max_completions(),
            handshake_timeout_ms: Self::default_handshake_timeout_ms(),
            probe_timeout_ms: Self::default_probe_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of worker threads, each owning one backend process.
    #[serde(default = "WorkersConfig::default_count")]
    pub count: usize,

    /// Wall-clock budget for a single job before its backend is restarted.
    #[serde(default = "WorkersConfig::default_job_timeout_ms")]
    pub job_timeout_ms: u64,
}

impl WorkersConfig {
    fn default_count() -> usize {
        2
    }

    fn default_job_timeout_ms() -> u64 {
        10_000
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: Self::default_count(),
            job_timeout_ms: Self::default_job_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Override the cache root (the interpreter version is still appended).
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Shadow package-level results to disk.
    #[serde(default = "CacheConfig::default_persist")]
    pub persist: bool,

    #[serde(default = "CacheConfig::default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    /// Idle time after which scoped entries are evicted.
    #[serde(default = "CacheConfig::default_max_age_secs")]
    pub max_age_secs: u64,
}

impl CacheConfig {
    fn default_persist() -> bool {
        true
    }

    fn default_reap_interval_secs() -> u64 {
        300
    }

    fn default_max_age_secs() -> u64 {
        300
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// The cache root before the interpreter version is appended.
    ///
    /// Precedence: explicit `root`, `KESTREL_CACHE_DIR`, `$XDG_CACHE_HOME/kestrel`,
    /// `~/.cache/kestrel`.
    pub fn resolved_root(&self) -> Option<PathBuf> {
        if let Some(root) = &self.root {
            return Some(root.clone());
        }
        if let Some(dir) = std::env::var_os("KESTREL_CACHE_DIR").filter(|v| !v.is_empty()) {
            return Some(PathBuf::from(dir));
        }
        if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
            return Some(PathBuf::from(xdg).join("kestrel"));
        }
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(|home| PathBuf::from(home).join(".cache").join("kestrel"))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            persist: Self::default_persist(),
            reap_interval_secs: Self::default_reap_interval_secs(),
            max_age_secs: Self::default_max_age_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    /// How long a request blocks for a fresh result before it is deferred.
    #[serde(default = "DispatchConfig::default_wait_ms")]
    pub wait_ms: u64,

    /// Extra search paths used for key derivation and passed to the engine.
    #[serde(default)]
    pub extra_path: Vec<PathBuf>,
}

impl DispatchConfig {
    fn default_wait_ms() -> u64 {
        50
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            wait_ms: Self::default_wait_ms(),
            extra_path: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` includes a source snippet; keep just the message.
        ConfigError::Toml(sanitize_toml_error_message(err.message()))
    }
}

fn sanitize_toml_error_message(message: &str) -> String {
    // Messages can still echo scalar values (`invalid type: string "..."`); redact them.
    static QUOTED_STRING_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = QUOTED_STRING_RE.get_or_init(|| {
        regex::Regex::new(r#""(?:[^"\\]|\\.)*""#).expect("quoted-string regex should compile")
    });
    re.replace_all(message, r#""<redacted>""#).into_owned()
}

impl KestrelConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config: KestrelConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.count == 0 {
            return Err(ConfigError::Invalid(
                "workers.count must be at least 1".to_owned(),
            ));
        }
        if self.workers.job_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "workers.job_timeout_ms must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = KestrelConfig::load_from_str("").expect("config should parse");
        assert_eq!(config, KestrelConfig::default());
        assert_eq!(config.backend.max_completions, 50);
        assert_eq!(config.workers.job_timeout(), Duration::from_secs(10));
        assert_eq!(config.cache.reap_interval(), Duration::from_secs(300));
    }

    #[test]
    fn toml_errors_do_not_echo_values() {
        let err = KestrelConfig::load_from_str("[workers]\ncount = \"secret-value\"\n")
            .expect_err("expected type error");
        let message = err.to_string();
        assert!(!message.contains("secret-value"), "{message}");
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = KestrelConfig::load_from_str("[workers]\ncount = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn explicit_cache_root_wins() {
        let config = CacheConfig {
            root: Some(PathBuf::from("/tmp/kestrel-test-root")),
            ..CacheConfig::default()
        };
        assert_eq!(
            config.resolved_root(),
            Some(PathBuf::from("/tmp/kestrel-test-root"))
        );
    }
}
