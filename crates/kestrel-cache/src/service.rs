use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use kestrel_core::{now_millis, CacheKey};
use parking_lot::{Condvar, Mutex};

use crate::disk::DiskShadow;
use crate::entry::{CacheEntry, EntryState};

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Persisted keys whose disk file has already been consulted or written this process.
    disk_seen: HashSet<CacheKey>,
}

/// Outcome of [`CacheService::put_if_newer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Stored(CacheEntry),
    /// A result submitted later already occupies the key.
    Superseded { current_millis: u64 },
}

/// The process-wide completion cache.
///
/// One mutex guards the map and every touch; it is never held across a backend call.
/// Writers signal a condition variable so callers can wait for a result with a deadline.
pub struct CacheService {
    inner: Mutex<Inner>,
    landed: Condvar,
    disk: Option<DiskShadow>,
}

impl CacheService {
    pub fn new(disk: Option<DiskShadow>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            landed: Condvar::new(),
            disk,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub fn disk(&self) -> Option<&DiskShadow> {
        self.disk.as_ref()
    }

    /// Loads a persisted entry into the map the first time its key is looked up.
    fn load_from_disk(&self, inner: &mut Inner, key: &CacheKey) {
        let Some(disk) = self.disk.as_ref() else {
            return;
        };
        if !key.is_persisted() || inner.entries.contains_key(key) || !inner.disk_seen.insert(key.clone()) {
            return;
        }
        if let Some(entry) = disk.load(key) {
            tracing::debug!(target: "kestrel.cache", key = %key, "loaded from disk");
            inner.entries.insert(key.clone(), entry);
        }
    }

    fn persist(&self, inner: &mut Inner, entry: &CacheEntry) {
        let Some(disk) = self.disk.as_ref() else {
            return;
        };
        if !entry.key.is_persisted() || entry.state != EntryState::Fresh {
            return;
        }
        inner.disk_seen.insert(entry.key.clone());
        match disk.store(entry) {
            Ok(path) => {
                tracing::debug!(target: "kestrel.cache", key = %entry.key, path = %path.display(), "stored to disk")
            }
            Err(err) => {
                tracing::warn!(target: "kestrel.cache", key = %entry.key, error = %err, "failed to persist cache entry")
            }
        }
    }

    /// Returns the entry for `key`, touching it.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        self.load_from_disk(&mut inner, key);
        let entry = inner.entries.get_mut(key)?;
        entry.touch();
        Some(entry.clone())
    }

    pub fn exists(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn store_locked(&self, inner: &mut Inner, mut entry: CacheEntry) -> CacheEntry {
        let stored = match inner.entries.get_mut(&entry.key) {
            Some(existing) => {
                if entry.state == EntryState::Stale {
                    // Keep serving the last good answer while a refresh is attempted.
                    entry.candidates = std::mem::take(&mut existing.candidates);
                }
                existing.update_from(&entry);
                existing.touch();
                existing.clone()
            }
            None => {
                inner.entries.insert(entry.key.clone(), entry.clone());
                entry
            }
        };
        self.persist(inner, &stored);
        self.landed.notify_all();
        stored
    }

    /// Stores `entry` unconditionally.
    ///
    /// A failed (`Stale`) entry inherits the candidates of the entry it replaces.
    pub fn put(&self, entry: CacheEntry) -> CacheEntry {
        let mut inner = self.inner.lock();
        self.store_locked(&mut inner, entry)
    }

    /// Stores `entry` unless the cached entry came from a later submission.
    pub fn put_if_newer(&self, entry: CacheEntry) -> PutOutcome {
        let mut inner = self.inner.lock();
        self.load_from_disk(&mut inner, &entry.key);
        if let Some(existing) = inner.entries.get(&entry.key) {
            if existing.created_at_millis > entry.created_at_millis {
                return PutOutcome::Superseded {
                    current_millis: existing.created_at_millis,
                };
            }
        }
        PutOutcome::Stored(self.store_locked(&mut inner, entry))
    }

    /// Inserts a `Pending` placeholder unless the key already has an entry.
    pub fn mark_pending(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        self.load_from_disk(&mut inner, key);
        if inner.entries.contains_key(key) {
            return false;
        }
        inner.entries.insert(key.clone(), CacheEntry::pending(key.clone()));
        true
    }

    /// Removes the `Pending` placeholder for `key` when its job produced nothing.
    /// Entries holding a result are left alone.
    pub fn clear_pending(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        let is_pending = inner
            .entries
            .get(key)
            .is_some_and(|entry| entry.state == EntryState::Pending);
        if is_pending {
            inner.entries.remove(key);
            self.landed.notify_all();
        }
        is_pending
    }

    /// Blocks until `key` holds a non-pending result submitted at or after
    /// `submitted_at_millis`, or `timeout` elapses.
    pub fn wait_for_result(
        &self,
        key: &CacheKey,
        submitted_at_millis: u64,
        timeout: Duration,
    ) -> Option<CacheEntry> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(entry) = inner.entries.get_mut(key) {
                if entry.state != EntryState::Pending && entry.created_at_millis >= submitted_at_millis {
                    entry.touch();
                    return Some(entry.clone());
                }
            }
            if self.landed.wait_until(&mut inner, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Evicts non-exempt entries idle for longer than `max_age` as of `now_millis`.
    pub fn evict_expired_at(&self, now_millis: u64, max_age: Duration) -> usize {
        let max_age_millis = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, entry| {
            key.category().is_reaper_exempt()
                || now_millis.saturating_sub(entry.last_touched_millis) <= max_age_millis
        });
        let removed = before - inner.entries.len();
        if removed > 0 {
            tracing::debug!(
                target: "kestrel.cache",
                removed,
                remaining = inner.entries.len(),
                "reaped idle cache entries"
            );
        }
        removed
    }

    pub fn evict_expired(&self, max_age: Duration) -> usize {
        self.evict_expired_at(now_millis(), max_age)
    }

    /// Starts the background reaper. The returned handle stops it when dropped.
    pub fn start_reaper(self: &Arc<Self>, interval: Duration, max_age: Duration) -> Reaper {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let service: Weak<CacheService> = Arc::downgrade(self);
        let thread_stop = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("kestrel-reaper".to_owned())
            .spawn(move || {
                let (stopped, wake) = &*thread_stop;
                let mut stopped = stopped.lock();
                loop {
                    let deadline = Instant::now() + interval;
                    while !*stopped {
                        if wake.wait_until(&mut stopped, deadline).timed_out() {
                            break;
                        }
                    }
                    if *stopped {
                        return;
                    }
                    let Some(service) = service.upgrade() else {
                        return;
                    };
                    service.evict_expired(max_age);
                }
            });

        match handle {
            Ok(handle) => Reaper {
                stop,
                handle: Some(handle),
            },
            Err(err) => {
                tracing::error!(target: "kestrel.cache", error = %err, "failed to spawn reaper thread");
                Reaper { stop, handle: None }
            }
        }
    }
}

/// Handle to the background reaper thread.
pub struct Reaper {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let (stopped, wake) = &*self.stop;
        *stopped.lock() = true;
        wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
