use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kestrel_core::{now_millis, CacheKey, Candidate};
use serde::{Deserialize, Serialize};

use crate::entry::{CacheEntry, EntryState};
use crate::error::{CacheError, Result};
use crate::util::{atomic_write, read_file_limited, remove_file_best_effort};

/// Bumped whenever [`DiskEntry`] changes shape; older files are discarded on load.
pub const DISK_FORMAT_VERSION: u32 = 1;

/// One persisted module result, stored at `<dir>/<module>.json`.
#[derive(Debug, Serialize, Deserialize)]
struct DiskEntry {
    version: u32,
    cache_key: CacheKey,
    time: u64,
    modules: BTreeMap<PathBuf, u64>,
    completions: Vec<Candidate>,
}

/// Directory holding persisted results for one interpreter version.
#[derive(Clone, Debug)]
pub struct DiskShadow {
    dir: PathBuf,
}

/// `<root>/<major.minor>`.
pub fn versioned_cache_dir(root: &Path, interpreter_version: &str) -> PathBuf {
    root.join(interpreter_version)
}

fn validate_module_name(module: &str) -> Result<()> {
    let valid = !module.is_empty()
        && !module.starts_with('.')
        && module
            .chars()
            .all(|c| c == '.' || c == '_' || c == '-' || c.is_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidModuleName {
            module: module.to_owned(),
        })
    }
}

impl DiskShadow {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, module: &str) -> Result<PathBuf> {
        validate_module_name(module)?;
        Ok(self.dir.join(format!("{module}.json")))
    }

    /// Loads the persisted entry for `key`.
    ///
    /// Unreadable, corrupt or outdated files are deleted and reported as a miss.
    pub fn load(&self, key: &CacheKey) -> Option<CacheEntry> {
        let module = key.module()?;
        let path = self.path_for(module).ok()?;
        let bytes = read_file_limited(&path)?;

        let parsed = serde_json::from_slice::<DiskEntry>(&bytes)
            .map_err(CacheError::from)
            .and_then(|disk| {
                if disk.version != DISK_FORMAT_VERSION {
                    return Err(CacheError::IncompatibleFormatVersion {
                        expected: DISK_FORMAT_VERSION,
                        found: disk.version,
                    });
                }
                Ok(disk)
            });

        match parsed {
            Ok(disk) if disk.cache_key == *key => Some(CacheEntry {
                key: disk.cache_key,
                created_at_millis: disk.time,
                last_touched_millis: now_millis(),
                dependency_mtimes: disk.modules,
                candidates: disk.completions,
                state: EntryState::Fresh,
            }),
            Ok(_) => {
                remove_file_best_effort(&path, "disk_shadow.key_mismatch");
                None
            }
            Err(err) => {
                tracing::debug!(
                    target: "kestrel.cache",
                    path = %path.display(),
                    error = %err,
                    "discarding unreadable cache file"
                );
                remove_file_best_effort(&path, "disk_shadow.corrupt");
                None
            }
        }
    }

    pub fn store(&self, entry: &CacheEntry) -> Result<PathBuf> {
        let Some(module) = entry.key.module() else {
            return Err(CacheError::InvalidModuleName {
                module: entry.key.to_string(),
            });
        };
        let path = self.path_for(module)?;
        let disk = DiskEntry {
            version: DISK_FORMAT_VERSION,
            cache_key: entry.key.clone(),
            time: entry.created_at_millis,
            modules: entry.dependency_mtimes.clone(),
            completions: entry.candidates.clone(),
        };
        let bytes = serde_json::to_vec(&disk)?;
        atomic_write(&path, &bytes)?;
        Ok(path)
    }

    /// Deletes every persisted entry. Returns the number of files removed.
    pub fn clear(&self) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && remove_file_best_effort(&path, "disk_shadow.clear")
            {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
