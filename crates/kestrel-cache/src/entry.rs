use std::collections::BTreeMap;
use std::path::PathBuf;

use kestrel_core::{file_mtime_millis, now_millis, CacheKey, Candidate};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    /// The last computation succeeded.
    Fresh,
    /// The last computation failed; candidates are carried over from an earlier success
    /// and the next lookup should trigger a refresh.
    Stale,
    /// A computation is in flight and nothing has landed yet.
    Pending,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Submission time of the request that produced this entry. Orders results per key.
    pub created_at_millis: u64,
    pub last_touched_millis: u64,
    /// Mtimes of the key's dependency files as of request submission, plus the module
    /// files candidates came from as of the result's arrival.
    pub dependency_mtimes: BTreeMap<PathBuf, u64>,
    pub candidates: Vec<Candidate>,
    pub state: EntryState,
}

impl CacheEntry {
    /// A successful computation.
    pub fn fresh(
        key: CacheKey,
        created_at_millis: u64,
        dependency_mtimes: BTreeMap<PathBuf, u64>,
        candidates: Vec<Candidate>,
    ) -> Self {
        Self {
            key,
            created_at_millis,
            last_touched_millis: now_millis(),
            dependency_mtimes,
            candidates,
            state: EntryState::Fresh,
        }
    }

    /// A failed computation.
    pub fn failed(
        key: CacheKey,
        created_at_millis: u64,
        dependency_mtimes: BTreeMap<PathBuf, u64>,
    ) -> Self {
        Self {
            state: EntryState::Stale,
            ..Self::fresh(key, created_at_millis, dependency_mtimes, Vec::new())
        }
    }

    pub(crate) fn pending(key: CacheKey) -> Self {
        Self {
            state: EntryState::Pending,
            ..Self::fresh(key, 0, BTreeMap::new(), Vec::new())
        }
    }

    /// Refreshes this entry in place with a newer computation.
    pub fn update_from(&mut self, other: &CacheEntry) {
        self.key = other.key.clone();
        self.created_at_millis = other.created_at_millis;
        self.dependency_mtimes = other.dependency_mtimes.clone();
        self.candidates = other.candidates.clone();
        self.state = other.state;
    }

    pub fn touch(&mut self) {
        self.last_touched_millis = now_millis();
    }

    /// True when every recorded dependency still has the recorded mtime.
    pub fn dependencies_unchanged(&self) -> bool {
        self.dependency_mtimes
            .iter()
            .all(|(path, mtime)| file_mtime_millis(path) == *mtime)
    }

    /// Whether the entry can be served without asking for a recomputation.
    pub fn is_fresh(&self) -> bool {
        self.state == EntryState::Fresh && self.dependencies_unchanged()
    }
}

/// Snapshot of the current mtimes of `paths`.
pub fn dependency_mtimes<I, P>(paths: I) -> BTreeMap<PathBuf, u64>
where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
{
    paths
        .into_iter()
        .map(|path| {
            let path = path.into();
            let mtime = file_mtime_millis(&path);
            (path, mtime)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn freshness_follows_dependency_mtimes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("example.py");
        std::fs::write(&file, "import os\n").unwrap();

        let entry = CacheEntry::fresh(
            CacheKey::From {
                module: "os".into(),
            },
            1,
            dependency_mtimes([file.clone()]),
            vec![Candidate::new("path", "module")],
        );
        assert!(entry.is_fresh());

        let later = SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(later)
            .unwrap();
        assert!(!entry.is_fresh());
    }

    #[test]
    fn failed_entries_are_never_fresh() {
        let entry = CacheEntry::failed(CacheKey::Boilerplate, 1, BTreeMap::new());
        assert_eq!(entry.state, EntryState::Stale);
        assert!(entry.dependencies_unchanged());
        assert!(!entry.is_fresh());
    }
}
