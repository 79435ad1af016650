use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use kestrel_cache::CacheService;
use kestrel_core::{CacheKey, Candidate};
use kestrel_dispatch::{Completion, Dispatcher, DispatcherOptions, RequestContext};
use kestrel_keys::SysPathResolver;
use kestrel_process::BackendError;
use kestrel_remote_proto::CompletionRequest;
use kestrel_worker::{CompletionBackend, PoolOptions, WorkerPool};
use parking_lot::{Condvar, Mutex};

/// Answers by key category. Sources containing `slow` block until [`FakeBackend::release`].
#[derive(Default)]
struct FakeBackend {
    calls: Mutex<Vec<CacheKey>>,
    released: Mutex<bool>,
    wake: Condvar,
}

impl FakeBackend {
    fn release(&self) {
        *self.released.lock() = true;
        self.wake.notify_all();
    }

    fn calls(&self) -> Vec<CacheKey> {
        self.calls.lock().clone()
    }
}

impl CompletionBackend for FakeBackend {
    fn completions(&self, request: &CompletionRequest) -> Result<Option<Vec<Candidate>>, BackendError> {
        self.calls.lock().push(request.cache_key.clone());
        if request.source.contains("slow") {
            let mut released = self.released.lock();
            while !*released {
                self.wake.wait(&mut released);
            }
        }
        let out = match &request.cache_key {
            CacheKey::Boilerplate => vec![
                Candidate::new("print", "function"),
                Candidate::new("len", "function"),
            ],
            CacheKey::From { module } => vec![
                Candidate::new("_private", "statement"),
                Candidate::new(format!("{module}_item"), "class"),
                Candidate::new("Counter", "class"),
            ],
            CacheKey::ScopedDot { object, .. } => vec![
                Candidate::new(format!("{object}_attr"), "instance"),
                Candidate::new("bar", "function"),
            ],
            CacheKey::ScopedVars { .. } => vec![
                Candidate::new("print", "statement"),
                Candidate::new("prices", "statement"),
            ],
            CacheKey::Direct { .. } => vec![Candidate::new("direct", "statement")],
            _ => Vec::new(),
        };
        Ok(Some(out))
    }

    fn interrupt(&self) {
        self.release();
    }

    fn restart(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn dispatcher(backend: &Arc<FakeBackend>, wait: Duration) -> Dispatcher {
    dispatcher_with_timeout(backend, wait, Duration::from_secs(30))
}

fn dispatcher_with_timeout(backend: &Arc<FakeBackend>, wait: Duration, job_timeout: Duration) -> Dispatcher {
    let backend = Arc::clone(backend);
    let pool = WorkerPool::start(
        PoolOptions {
            workers: 1,
            job_timeout,
        },
        move |_| Ok(backend.clone() as Arc<dyn CompletionBackend>),
    )
    .expect("pool should start");
    let dispatcher = Dispatcher::start(
        Arc::new(CacheService::in_memory()),
        pool,
        Box::new(SysPathResolver::new(Vec::new())),
        DispatcherOptions {
            wait,
            ..Default::default()
        },
    )
    .expect("dispatcher should start");
    wait_until(|| dispatcher.poll(&CacheKey::Boilerplate).is_some());
    dispatcher
}

fn buffer(dir: &Path, text: &str) -> (PathBuf, Vec<String>) {
    let path = dir.join("example.py");
    std::fs::write(&path, text).unwrap();
    (path, text.lines().map(str::to_owned).collect())
}

fn cursor_at_end(path: &Path, lines: &[String]) -> RequestContext {
    let line = lines.len();
    let column = lines.last().map_or(0, String::len);
    RequestContext::at(path, lines.to_vec(), line, column)
}

fn names(candidates: &[Candidate]) -> Vec<&str> {
    candidates.iter().map(|candidate| candidate.name.as_str()).collect()
}

#[test]
fn import_lines_are_answered_without_a_worker() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let dispatcher = dispatcher(&backend, Duration::from_secs(5));

    let (path, lines) = buffer(dir.path(), "import os");
    assert_eq!(dispatcher.request(&cursor_at_end(&path, &lines)), Completion::Ready(Vec::new()));

    let (path, lines) = buffer(dir.path(), "from os imp");
    assert_eq!(
        dispatcher.request(&cursor_at_end(&path, &lines)),
        Completion::Ready(vec![Candidate::keyword("import")])
    );

    assert_eq!(backend.calls(), vec![CacheKey::Boilerplate]);
}

#[test]
fn second_identical_request_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let dispatcher = dispatcher(&backend, Duration::from_secs(5));

    let (path, lines) = buffer(dir.path(), "from collections import ");
    let ctx = cursor_at_end(&path, &lines);
    assert_eq!(
        dispatcher.derive(&ctx).key,
        Some(CacheKey::From {
            module: "collections".into()
        })
    );
    assert_eq!(dispatcher.derive(&ctx).dependencies, vec![path.clone()]);

    let first = dispatcher.request(&ctx);
    assert_eq!(names(first.candidates()), vec!["collections_item", "Counter", "_private"]);
    assert_eq!(backend.calls().len(), 2);

    let second = dispatcher.request(&ctx);
    assert_eq!(second, first);
    assert_eq!(backend.calls().len(), 2);

    // Touching the buffer invalidates the entry.
    std::fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
    let third = dispatcher.request(&ctx);
    assert_eq!(third, first);
    assert_eq!(backend.calls().len(), 3);
}

#[test]
fn vars_results_are_mixed_with_boilerplate_and_ranked() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let dispatcher = dispatcher(&backend, Duration::from_secs(5));

    let (path, lines) = buffer(dir.path(), "def f():\n    pri");
    let ctx = cursor_at_end(&path, &lines);
    assert!(matches!(dispatcher.derive(&ctx).key, Some(CacheKey::ScopedVars { .. })));

    let out = dispatcher.request(&ctx);
    assert_eq!(names(out.candidates()), vec!["len", "prices", "print"]);
    let print = &out.candidates()[2];
    assert_eq!(print.kind, "function");

    // Variable keys are always recomputed.
    dispatcher.request(&ctx);
    assert_eq!(backend.calls().len(), 3);

    let functions = dispatcher.request(&ctx.clone().with_kinds(vec!["function".into()]));
    assert_eq!(names(functions.candidates()), vec!["len", "print"]);
}

#[test]
fn slow_jobs_are_deferred_and_announced() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let dispatcher = dispatcher(&backend, Duration::from_millis(20));
    let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
    dispatcher.set_on_ready(move |key| {
        let _ = ready_tx.send(key.clone());
    });

    let (path, lines) = buffer(dir.path(), "# slow\nfrom json import ");
    let ctx = cursor_at_end(&path, &lines);
    let key = CacheKey::From { module: "json".into() };

    assert_eq!(
        dispatcher.request(&ctx),
        Completion::Deferred {
            key: key.clone(),
            stale: Vec::new()
        }
    );
    assert_eq!(dispatcher.poll(&key), None);

    // An in-flight key is not enqueued again.
    assert!(dispatcher.request(&ctx).is_deferred());
    assert_eq!(dispatcher.in_flight(), 1);

    backend.release();
    assert_eq!(ready_rx.recv_timeout(Duration::from_secs(10)).unwrap(), key);

    let polled = dispatcher.poll(&key).expect("result should be cached");
    assert_eq!(names(&polled), vec!["Counter", "json_item", "_private"]);
    assert_eq!(dispatcher.request(&ctx), Completion::Ready(polled));
    assert_eq!(backend.calls().len(), 2);
}

#[test]
fn different_scopes_do_not_share_entries() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let dispatcher = dispatcher(&backend, Duration::from_secs(5));

    let (path, lines) = buffer(
        dir.path(),
        "def outer():\n    def inner():\n        foo.ba\ndef other():\n    foo.ba",
    );
    let inner = dispatcher.derive(&RequestContext::at(&path, lines.clone(), 3, 14)).key;
    let other = dispatcher.derive(&RequestContext::at(&path, lines, 5, 10)).key;

    let Some(CacheKey::ScopedDot { scope, object, .. }) = &inner else {
        panic!("expected a scoped dot key, got {inner:?}");
    };
    assert_eq!(scope, &vec!["outer".to_string(), "inner".to_string()]);
    assert_eq!(object, "foo");
    assert_ne!(inner, other);
}

#[test]
fn uncacheable_requests_can_run_directly() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let dispatcher = dispatcher(&backend, Duration::from_secs(5));

    let (path, lines) = buffer(dir.path(), "x = 1\n  ");
    let ctx = cursor_at_end(&path, &lines);
    assert_eq!(dispatcher.derive(&ctx).key, None);
    assert_eq!(dispatcher.request(&ctx), Completion::Ready(Vec::new()));

    let out = dispatcher.request(&ctx.require_direct());
    assert_eq!(names(out.candidates()), vec!["direct"]);
    assert!(matches!(backend.calls().last(), Some(CacheKey::Direct { .. })));
    assert_eq!(dispatcher.cache().len(), 1);
}

#[test]
fn reissue_after_notification_is_served_once_for_always_stale_keys() {
    let cases = [
        ("# slow\ndef f():\n    pri", vec!["len", "prices", "print"]),
        ("# slow\ndef f():\n    foo.ba", vec!["bar", "foo_attr"]),
    ];
    for (text, expected) in cases {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        let dispatcher = dispatcher(&backend, Duration::from_millis(20));
        let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
        dispatcher.set_on_ready(move |key| {
            let _ = ready_tx.send(key.clone());
        });

        let (path, lines) = buffer(dir.path(), text);
        let ctx = cursor_at_end(&path, &lines);
        let key = dispatcher.derive(&ctx).key.expect("buffer should produce a key");
        assert!(key.category().is_always_stale(), "{key:?}");

        assert!(dispatcher.request(&ctx).is_deferred());
        backend.release();
        assert_eq!(ready_rx.recv_timeout(Duration::from_secs(10)).unwrap(), key);

        // The editor re-issues the request it was told about.
        let reissued = dispatcher.request(&ctx);
        assert!(!reissued.is_deferred());
        assert_eq!(names(reissued.candidates()), expected);
        assert_eq!(backend.calls().len(), 2);
        assert_eq!(dispatcher.in_flight(), 0);
        assert!(ready_rx.try_recv().is_err());

        // Later requests recompute as usual.
        dispatcher.request(&ctx);
        wait_until(|| dispatcher.in_flight() == 0);
        assert_eq!(backend.calls().len(), 3);
    }
}

#[test]
fn dropped_backlog_jobs_poll_as_a_miss_and_dispatch_again() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let dispatcher = dispatcher_with_timeout(&backend, Duration::from_millis(20), Duration::from_millis(300));
    let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
    dispatcher.set_on_ready(move |key| {
        let _ = ready_tx.send(key.clone());
    });

    let (path, lines) = buffer(dir.path(), "# slow\nfrom hung import ");
    let hung = cursor_at_end(&path, &lines);
    let (path, lines) = buffer(dir.path(), "from older import ");
    let older = cursor_at_end(&path, &lines);
    let (path, lines) = buffer(dir.path(), "from newest import ");
    let newest = cursor_at_end(&path, &lines);
    let older_key = CacheKey::From { module: "older".into() };

    // One worker: `hung` times out, `older` is dropped from the backlog, `newest` runs.
    assert!(dispatcher.request(&hung).is_deferred());
    assert!(dispatcher.request(&older).is_deferred());
    assert!(dispatcher.request(&newest).is_deferred());
    assert_eq!(dispatcher.poll(&older_key), None);

    wait_until(|| dispatcher.in_flight() == 0);
    assert_eq!(dispatcher.poll(&older_key), Some(Vec::new()));
    assert!(!dispatcher.cache().exists(&older_key));
    assert!(ready_rx.try_iter().any(|key| key == older_key));
    assert!(!backend.calls().contains(&older_key));

    dispatcher.request(&older);
    wait_until(|| dispatcher.in_flight() == 0);
    assert!(backend.calls().contains(&older_key));
    let polled = dispatcher.poll(&older_key).expect("nothing is in flight");
    assert_eq!(names(&polled), vec!["Counter", "older_item", "_private"]);
}
