//! Completion request dispatch.
//!
//! The [`Dispatcher`] sits between the editor layer and the worker pool. For each request
//! it derives a cache key, serves fresh cache entries directly, and otherwise enqueues a
//! job and waits a short, bounded time for the result. Requests that outlive the wait are
//! answered as [`Completion::Deferred`]; the result lands in the cache later, where
//! [`Dispatcher::poll`] (or the next identical request) picks it up. The first request
//! for a deferred key after its job settles is answered from the cache even for
//! always-stale keys, so a re-issue on notification does not dispatch again.
//!
//! A single processor thread drains the pool's result channel into the cache, discarding
//! results older than the cached entry for the same key.

mod context;
mod rank;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use kestrel_cache::{dependency_mtimes, CacheEntry, CacheService, EntryState, PutOutcome};
use kestrel_core::{now_millis, CacheKey, Candidate, KeyCategory};
use kestrel_keys::{DerivedKey, KeyDeriver, ModuleResolver};
use kestrel_worker::{JobOutcome, WorkItem, WorkResult, WorkerPool};
use parking_lot::Mutex;

pub use context::RequestContext;
pub use rank::{mix_boilerplate, rank, sort_key};

/// Invoked with the key of a deferred request once its job settles: the result is cached,
/// or the job was dropped and the key polls as a miss.
pub type ReadyCallback = Arc<dyn Fn(&CacheKey) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    Ready(Vec<Candidate>),
    /// The job is still running. `stale` holds whatever the cache had for the key.
    Deferred { key: CacheKey, stale: Vec<Candidate> },
}

impl Completion {
    pub fn candidates(&self) -> &[Candidate] {
        match self {
            Completion::Ready(candidates) => candidates,
            Completion::Deferred { stale, .. } => stale,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Completion::Deferred { .. })
    }
}

#[derive(Clone, Debug)]
pub struct DispatcherOptions {
    /// How long a request blocks on its job before it is deferred.
    pub wait: Duration,
    /// How long an uncached direct request blocks before giving up.
    pub direct_wait: Duration,
    /// Extra module search directories for key derivation.
    pub extra_path: Vec<PathBuf>,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(50),
            direct_wait: Duration::from_secs(2),
            extra_path: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Tracking {
    in_flight: HashSet<CacheKey>,
    /// In-flight keys whose requester was answered with `Deferred`.
    deferred: HashSet<CacheKey>,
    /// Deferred keys whose result has landed and not yet been served to a request.
    landed: HashSet<CacheKey>,
}

struct Shared {
    cache: Arc<CacheService>,
    tracking: Mutex<Tracking>,
    direct_waiters: Mutex<HashMap<u64, Sender<WorkResult>>>,
    on_ready: Mutex<Option<ReadyCallback>>,
}

impl Shared {
    fn process_results(&self, results: Receiver<WorkResult>) {
        for result in results.iter() {
            if let CacheKey::Direct { id } = result.key {
                match self.direct_waiters.lock().remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(result);
                    }
                    None => tracing::debug!(target: "kestrel.dispatch", id, "direct result arrived after its deadline"),
                }
                continue;
            }
            self.store(result);
        }
        tracing::debug!(target: "kestrel.dispatch", "result channel closed");
    }

    fn store(&self, result: WorkResult) {
        let key = result.key;
        let entry = match result.outcome {
            JobOutcome::Completed(candidates) => Some(CacheEntry::fresh(
                key.clone(),
                result.submitted_at_millis,
                result.dependency_mtimes,
                candidates,
            )),
            JobOutcome::Failed => Some(CacheEntry::failed(
                key.clone(),
                result.submitted_at_millis,
                result.dependency_mtimes,
            )),
            JobOutcome::Dropped => {
                tracing::debug!(target: "kestrel.dispatch", key = %key, "job dropped");
                self.cache.clear_pending(&key);
                None
            }
        };
        let has_result = entry.is_some();

        let stored = match entry.map(|entry| self.cache.put_if_newer(entry)) {
            Some(PutOutcome::Stored(_)) => true,
            Some(PutOutcome::Superseded { current_millis }) => {
                tracing::debug!(
                    target: "kestrel.dispatch",
                    key = %key,
                    submitted = result.submitted_at_millis,
                    current = current_millis,
                    "discarding result older than the cached entry"
                );
                false
            }
            None => false,
        };

        let was_deferred = {
            let mut tracking = self.tracking.lock();
            tracking.in_flight.remove(&key);
            let was_deferred = tracking.deferred.remove(&key);
            if was_deferred && stored {
                tracking.landed.insert(key.clone());
            }
            was_deferred
        };
        if was_deferred && (stored || !has_result) {
            let callback = self.on_ready.lock().clone();
            if let Some(callback) = callback {
                callback(&key);
            }
        }
    }
}

/// Routes completion requests through the cache and the worker pool.
pub struct Dispatcher {
    shared: Arc<Shared>,
    pool: WorkerPool,
    resolver: Box<dyn ModuleResolver>,
    options: DispatcherOptions,
    next_direct_id: AtomicU64,
    processor: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Starts the result processor and enqueues the boilerplate job.
    pub fn start(
        cache: Arc<CacheService>,
        pool: WorkerPool,
        resolver: Box<dyn ModuleResolver>,
        options: DispatcherOptions,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            cache,
            tracking: Mutex::new(Tracking::default()),
            direct_waiters: Mutex::new(HashMap::new()),
            on_ready: Mutex::new(None),
        });

        let results = pool.results().clone();
        let processor = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("kestrel-dispatch".to_owned())
                .spawn(move || shared.process_results(results))?
        };

        let dispatcher = Self {
            shared,
            pool,
            resolver,
            options,
            next_direct_id: AtomicU64::new(0),
            processor: Some(processor),
        };
        dispatcher.enqueue_boilerplate();
        Ok(dispatcher)
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        &self.shared.cache
    }

    pub fn set_on_ready(&self, callback: impl Fn(&CacheKey) + Send + Sync + 'static) {
        *self.shared.on_ready.lock() = Some(Arc::new(callback));
    }

    pub fn derive(&self, ctx: &RequestContext) -> DerivedKey {
        let mut extra_path = self.options.extra_path.clone();
        extra_path.extend(ctx.options.extra_path.iter().cloned());
        KeyDeriver::new(self.resolver.as_ref(), &extra_path).derive(&ctx.filename, &ctx.cursor, &ctx.source)
    }

    pub fn request(&self, ctx: &RequestContext) -> Completion {
        let DerivedKey { key, dependencies } = self.derive(ctx);
        let Some(key) = key else {
            if ctx.require_direct {
                return Completion::Ready(self.direct(ctx));
            }
            return Completion::Ready(Vec::new());
        };

        match key.category() {
            KeyCategory::ImportKeyword => return Completion::Ready(vec![Candidate::keyword("import")]),
            KeyCategory::Import => return Completion::Ready(Vec::new()),
            _ => {}
        }

        let cached = self.shared.cache.get(&key);
        let landed = self.shared.tracking.lock().landed.remove(&key);
        if let Some(entry) = &cached {
            if landed && entry.state != EntryState::Pending {
                tracing::trace!(target: "kestrel.dispatch", key = %key, "serving landed result");
                return Completion::Ready(self.finish(&key, entry, ctx));
            }
            if entry.is_fresh() && !key.category().is_always_stale() {
                tracing::trace!(target: "kestrel.dispatch", key = %key, "cache hit");
                return Completion::Ready(self.finish(&key, entry, ctx));
            }
        }
        let stale = match &cached {
            Some(entry) if entry.state != EntryState::Pending => self.finish(&key, entry, ctx),
            _ => Vec::new(),
        };

        {
            let mut tracking = self.shared.tracking.lock();
            if tracking.in_flight.contains(&key) {
                tracking.deferred.insert(key.clone());
                return Completion::Deferred { key, stale };
            }
            tracking.in_flight.insert(key.clone());
        }

        self.shared.cache.mark_pending(&key);
        let item = self.work_item(key.clone(), dependencies, ctx);
        let submitted_at = item.submitted_at_millis;
        if !self.pool.submit(item) {
            tracing::warn!(target: "kestrel.dispatch", key = %key, "worker pool is shut down");
            self.shared.tracking.lock().in_flight.remove(&key);
            return Completion::Ready(stale);
        }
        tracing::debug!(target: "kestrel.dispatch", key = %key, "dispatched");

        if let Some(entry) = self.shared.cache.wait_for_result(&key, submitted_at, self.options.wait) {
            return Completion::Ready(self.finish(&key, &entry, ctx));
        }

        {
            let mut tracking = self.shared.tracking.lock();
            if tracking.in_flight.contains(&key) {
                tracking.deferred.insert(key.clone());
                tracing::debug!(target: "kestrel.dispatch", key = %key, "deferred");
                return Completion::Deferred { key, stale };
            }
        }

        // The job settled between the wait and the lock. Without an entry it was dropped.
        match self.shared.cache.get(&key) {
            Some(entry) if entry.state != EntryState::Pending => Completion::Ready(self.finish(&key, &entry, ctx)),
            _ => Completion::Ready(stale),
        }
    }

    /// Candidates for a previously deferred key, or `None` while its job is queued or
    /// running. A key with nothing cached, such as one whose job was dropped, polls as an
    /// empty miss; request it again to recompute.
    pub fn poll(&self, key: &CacheKey) -> Option<Vec<Candidate>> {
        if self.shared.tracking.lock().in_flight.contains(key) {
            return None;
        }
        match self.shared.cache.get(key) {
            Some(entry) if entry.state != EntryState::Pending => {
                let mut candidates = self.mix(key, &entry);
                rank(&mut candidates);
                Some(candidates)
            }
            _ => Some(Vec::new()),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.shared.tracking.lock().in_flight.len()
    }

    /// Stops the pool and joins the result processor.
    pub fn shutdown(&mut self) {
        self.pool.shutdown();
        if let Some(processor) = self.processor.take() {
            let _ = processor.join();
        }
    }

    fn enqueue_boilerplate(&self) {
        let key = CacheKey::Boilerplate;
        self.shared.tracking.lock().in_flight.insert(key.clone());
        self.shared.cache.mark_pending(&key);
        let item = WorkItem {
            key: key.clone(),
            dependencies: Vec::new(),
            dependency_mtimes: Default::default(),
            source: String::new(),
            line: 1,
            column: 0,
            filename: None,
            options: None,
            submitted_at_millis: now_millis(),
        };
        if !self.pool.submit(item) {
            self.shared.tracking.lock().in_flight.remove(&key);
        }
    }

    fn work_item(&self, key: CacheKey, dependencies: Vec<PathBuf>, ctx: &RequestContext) -> WorkItem {
        WorkItem {
            key,
            dependency_mtimes: dependency_mtimes(dependencies.iter().cloned()),
            dependencies,
            source: ctx.source.join("\n"),
            line: ctx.cursor.line as u32,
            column: ctx.column,
            filename: Some(ctx.filename.clone()),
            options: Some(ctx.options.clone()),
            submitted_at_millis: now_millis(),
        }
    }

    /// Runs an uncached completion through the pool under an ephemeral key.
    fn direct(&self, ctx: &RequestContext) -> Vec<Candidate> {
        let id = self.next_direct_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.shared.direct_waiters.lock().insert(id, tx);

        let item = self.work_item(CacheKey::Direct { id }, vec![ctx.filename.clone()], ctx);
        let result = if self.pool.submit(item) {
            rx.recv_timeout(self.options.direct_wait).ok()
        } else {
            None
        };
        self.shared.direct_waiters.lock().remove(&id);

        let mut candidates = match result.map(|result| result.outcome) {
            Some(JobOutcome::Completed(candidates)) => candidates,
            _ => Vec::new(),
        };
        ctx.retain_kinds(&mut candidates);
        rank(&mut candidates);
        candidates
    }

    fn mix(&self, key: &CacheKey, entry: &CacheEntry) -> Vec<Candidate> {
        if key.category() != KeyCategory::Vars {
            return entry.candidates.clone();
        }
        let boilerplate = self
            .shared
            .cache
            .get(&CacheKey::Boilerplate)
            .map(|entry| entry.candidates)
            .unwrap_or_default();
        mix_boilerplate(&boilerplate, &entry.candidates)
    }

    fn finish(&self, key: &CacheKey, entry: &CacheEntry, ctx: &RequestContext) -> Vec<Candidate> {
        let mut candidates = self.mix(key, entry);
        ctx.retain_kinds(&mut candidates);
        rank(&mut candidates);
        candidates
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
