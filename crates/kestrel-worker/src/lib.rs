//! Fixed-size worker pool driving backend processes.
//!
//! Each worker thread owns one [`CompletionBackend`] and pulls [`WorkItem`]s from a shared
//! FIFO queue. Every backend call runs under a watchdog; a job that overruns its budget
//! gets the backend interrupted and restarted, and the jobs queued behind it (all but the
//! newest) are dropped as obsolete. Results are published on a shared channel.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use kestrel_cache::dependency_mtimes;
use kestrel_core::{CacheKey, Candidate, RequestOptions};
use kestrel_process::{BackendClient, BackendError};
use kestrel_remote_proto::CompletionRequest;
use tokio_util::sync::CancellationToken;

mod watchdog;

pub use watchdog::{run_with_timeout, TaskError};

/// The seam between workers and a backend process.
pub trait CompletionBackend: Send + Sync {
    fn completions(&self, request: &CompletionRequest) -> Result<Option<Vec<Candidate>>, BackendError>;

    /// Unblocks an in-flight [`Self::completions`] call from another thread.
    fn interrupt(&self);

    fn restart(&self) -> Result<(), BackendError>;
}

impl CompletionBackend for BackendClient {
    fn completions(&self, request: &CompletionRequest) -> Result<Option<Vec<Candidate>>, BackendError> {
        BackendClient::completions(self, request)
    }

    fn interrupt(&self) {
        BackendClient::interrupt(self)
    }

    fn restart(&self) -> Result<(), BackendError> {
        BackendClient::restart(self)
    }
}

/// One completion job, consumed by exactly one worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub key: CacheKey,
    pub dependencies: Vec<PathBuf>,
    /// Mtimes of `dependencies` taken when the job was submitted.
    pub dependency_mtimes: BTreeMap<PathBuf, u64>,
    pub source: String,
    /// 1-based line.
    pub line: u32,
    pub column: u32,
    pub filename: Option<PathBuf>,
    pub options: Option<RequestOptions>,
    /// When the dispatcher enqueued the job; orders results for the same key.
    pub submitted_at_millis: u64,
}

impl WorkItem {
    pub fn to_request(&self) -> CompletionRequest {
        CompletionRequest {
            cache_key: self.key.clone(),
            dependencies: self.dependencies.clone(),
            source: self.source.clone(),
            line: self.line,
            column: self.column,
            filename: self.filename.clone(),
            options: self.options.clone().filter(|options| !options.is_empty()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(Vec<Candidate>),
    /// The engine failed, the backend crashed or the job timed out.
    Failed,
    /// Discarded unprocessed while recovering from a timed-out job.
    Dropped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkResult {
    pub key: CacheKey,
    pub submitted_at_millis: u64,
    /// The job's submission-time dependency mtimes, plus every module file a candidate
    /// came from (stat'd when the result is built).
    pub dependency_mtimes: BTreeMap<PathBuf, u64>,
    pub outcome: JobOutcome,
}

impl WorkResult {
    fn new(item: &WorkItem, outcome: JobOutcome) -> Self {
        let modules: Vec<PathBuf> = match &outcome {
            JobOutcome::Completed(candidates) => candidates
                .iter()
                .filter_map(|candidate| candidate.module.clone())
                .filter(|path| path.is_file())
                .collect(),
            _ => Vec::new(),
        };
        let dependency_mtimes = match outcome {
            JobOutcome::Dropped => BTreeMap::new(),
            _ => {
                let mut mtimes = item.dependency_mtimes.clone();
                for (path, mtime) in dependency_mtimes(modules) {
                    mtimes.entry(path).or_insert(mtime);
                }
                mtimes
            }
        };
        Self {
            key: item.key.clone(),
            submitted_at_millis: item.submitted_at_millis,
            dependency_mtimes,
            outcome,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to start the backend for worker {worker}: {source}")]
    Backend {
        worker: usize,
        #[source]
        source: BackendError,
    },
    #[error("failed to spawn worker thread {worker}: {source}")]
    Thread {
        worker: usize,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub workers: usize,
    /// Wall-clock budget for a single backend call.
    pub job_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            job_timeout: Duration::from_secs(10),
        }
    }
}

struct Worker {
    id: usize,
    backend: Arc<dyn CompletionBackend>,
    jobs: Receiver<WorkItem>,
    results: Sender<WorkResult>,
    job_timeout: Duration,
    shutdown: CancellationToken,
}

impl Worker {
    fn run(self) {
        tracing::debug!(target: "kestrel.worker", worker = self.id, "worker started");
        let mut next: Option<WorkItem> = None;
        loop {
            let item = match next.take() {
                Some(item) => item,
                None => match self.jobs.recv() {
                    Ok(item) => item,
                    Err(_) => break,
                },
            };
            if self.shutdown.is_cancelled() {
                break;
            }
            let (result, newest) = self.process(item);
            next = newest;
            if self.results.send(result).is_err() {
                break;
            }
        }
        tracing::debug!(target: "kestrel.worker", worker = self.id, "worker stopped");
    }

    /// Runs one job. After a timeout also returns the newest backlog item, which this
    /// worker runs next.
    fn process(&self, item: WorkItem) -> (WorkResult, Option<WorkItem>) {
        let request = item.to_request();
        let backend = Arc::clone(&self.backend);
        let outcome = run_with_timeout(self.job_timeout, &self.shutdown, move || {
            backend.completions(&request)
        });

        match outcome {
            Ok(Ok(Some(candidates))) => (WorkResult::new(&item, JobOutcome::Completed(candidates)), None),
            Ok(Ok(None)) => {
                tracing::debug!(target: "kestrel.worker", worker = self.id, key = %item.key, "engine produced no result");
                (WorkResult::new(&item, JobOutcome::Failed), None)
            }
            Ok(Err(err)) => {
                tracing::warn!(target: "kestrel.worker", worker = self.id, key = %item.key, error = %err, "backend request failed");
                (WorkResult::new(&item, JobOutcome::Failed), None)
            }
            Err(TaskError::Panicked(message)) => {
                tracing::error!(target: "kestrel.worker", worker = self.id, key = %item.key, panic = %message, "backend call panicked");
                (WorkResult::new(&item, JobOutcome::Failed), None)
            }
            Err(TaskError::Cancelled) => {
                self.backend.interrupt();
                (WorkResult::new(&item, JobOutcome::Dropped), None)
            }
            Err(TaskError::DeadlineExceeded(budget)) => {
                tracing::warn!(
                    target: "kestrel.worker",
                    worker = self.id,
                    key = %item.key,
                    budget_ms = budget.as_millis() as u64,
                    "job timed out; restarting backend"
                );
                let newest = self.drain_backlog();
                self.backend.interrupt();
                if let Err(err) = self.backend.restart() {
                    tracing::error!(target: "kestrel.worker", worker = self.id, error = %err, "failed to restart backend");
                }
                (WorkResult::new(&item, JobOutcome::Failed), newest)
            }
        }
    }

    /// Empties the shared queue, publishing everything but the newest item as dropped.
    fn drain_backlog(&self) -> Option<WorkItem> {
        let mut newest: Option<WorkItem> = None;
        let mut dropped = 0usize;
        loop {
            match self.jobs.try_recv() {
                Ok(item) => {
                    if let Some(older) = newest.replace(item) {
                        dropped += 1;
                        let _ = self.results.send(WorkResult::new(&older, JobOutcome::Dropped));
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if dropped > 0 {
            tracing::debug!(target: "kestrel.worker", worker = self.id, dropped, "dropped stale backlog");
        }
        newest
    }
}

/// A fixed set of worker threads sharing one job queue and one result channel.
pub struct WorkerPool {
    jobs: Option<Sender<WorkItem>>,
    results: Receiver<WorkResult>,
    handles: Vec<JoinHandle<()>>,
    backends: Vec<Arc<dyn CompletionBackend>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Starts `options.workers` threads, creating each worker's backend with `factory`.
    pub fn start<F>(options: PoolOptions, mut factory: F) -> Result<Self, PoolError>
    where
        F: FnMut(usize) -> Result<Arc<dyn CompletionBackend>, BackendError>,
    {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<WorkItem>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<WorkResult>();
        let shutdown = CancellationToken::new();

        let mut pool = Self {
            jobs: Some(job_tx),
            results: result_rx,
            handles: Vec::with_capacity(options.workers),
            backends: Vec::with_capacity(options.workers),
            shutdown: shutdown.clone(),
        };

        for id in 0..options.workers.max(1) {
            let backend = factory(id).map_err(|source| PoolError::Backend { worker: id, source })?;
            let worker = Worker {
                id,
                backend: Arc::clone(&backend),
                jobs: job_rx.clone(),
                results: result_tx.clone(),
                job_timeout: options.job_timeout,
                shutdown: shutdown.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("kestrel-worker-{id}"))
                .spawn(move || worker.run())
                .map_err(|source| PoolError::Thread { worker: id, source })?;
            pool.backends.push(backend);
            pool.handles.push(handle);
        }
        Ok(pool)
    }

    /// Enqueues a job without blocking. Returns `false` once the pool is shut down.
    pub fn submit(&self, item: WorkItem) -> bool {
        match &self.jobs {
            Some(jobs) => jobs.send(item).is_ok(),
            None => false,
        }
    }

    pub fn results(&self) -> &Receiver<WorkResult> {
        &self.results
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.jobs.as_ref().map_or(0, Sender::len)
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Stops accepting jobs, interrupts in-flight calls and joins every worker.
    pub fn shutdown(&mut self) {
        if self.jobs.take().is_none() && self.handles.is_empty() {
            return;
        }
        self.shutdown.cancel();
        for backend in &self.backends {
            backend.interrupt();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
