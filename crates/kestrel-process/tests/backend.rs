use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kestrel_core::{CacheKey, Candidate};
use kestrel_process::{BackendClient, BackendCommand, BackendError, ClientOptions};
use kestrel_remote_proto::{CompletionRequest, ProtocolError};

fn helper() -> BackendCommand {
    BackendCommand::new(env!("CARGO_BIN_EXE_kestrel_backend_test_helper"))
}

fn options() -> ClientOptions {
    ClientOptions {
        max_completions: 50,
        handshake_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_millis(50),
    }
}

fn request(source: &str) -> CompletionRequest {
    CompletionRequest {
        cache_key: CacheKey::Import,
        dependencies: Vec::new(),
        source: source.to_owned(),
        line: 1,
        column: 0,
        filename: None,
        options: None,
    }
}

fn fact<'a>(candidates: &'a [Candidate], name: &str) -> &'a str {
    candidates
        .iter()
        .find(|c| c.name == name)
        .map(|c| c.description.as_str())
        .unwrap_or_default()
}

fn complete(client: &BackendClient, source: &str) -> Vec<Candidate> {
    client
        .completions(&request(source))
        .expect("request should succeed")
        .expect("helper always answers")
}

#[test]
fn handshake_and_requests() {
    let client = BackendClient::spawn(helper(), options()).unwrap();
    assert_eq!(client.engine_version().unwrap().name, "test-helper");

    let first = complete(&client, "a");
    let second = complete(&client, "b");
    assert_eq!(fact(&first, "served"), "1");
    assert_eq!(fact(&second, "served"), "2");
    assert_eq!(fact(&first, "key"), r#"("import~",)"#);
    assert_eq!(fact(&first, "pid"), client.pid().to_string());
}

#[test]
fn restarts_after_completion_ceiling() {
    let client = BackendClient::spawn(
        helper(),
        ClientOptions {
            max_completions: 2,
            ..options()
        },
    )
    .unwrap();

    let pids: Vec<String> = (0..3)
        .map(|_| fact(&complete(&client, "x"), "pid").to_owned())
        .collect();
    assert_eq!(pids[0], pids[1]);
    assert_ne!(pids[1], pids[2]);
    assert_eq!(client.restart_count(), 1);
}

#[test]
fn python_path_is_appended() {
    let command = helper().python_path([PathBuf::from("/opt/engine")]);
    let client = BackendClient::spawn(command, options()).unwrap();
    let candidates = complete(&client, "x");
    assert!(fact(&candidates, "pythonpath").ends_with("/opt/engine"));
}

#[test]
fn missing_handshake_is_fatal() {
    let started = Instant::now();
    let err = BackendClient::spawn(
        helper().arg("--no-handshake"),
        ClientOptions {
            handshake_timeout: Duration::from_millis(200),
            ..options()
        },
    )
    .err()
    .expect("spawn should fail");
    assert!(matches!(err, BackendError::HandshakeTimeout(_)), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn protocol_version_mismatch_is_fatal() {
    let err = BackendClient::spawn(helper().arg("--protocol-version").arg("999"), options())
        .err()
        .expect("spawn should fail");
    assert!(
        matches!(
            err,
            BackendError::Handshake(ProtocolError::VersionMismatch { found: 999, .. })
        ),
        "{err:?}"
    );
}

#[test]
fn crash_is_reported_and_replaced() {
    let client = BackendClient::spawn(helper().arg("--exit-after").arg("1"), options()).unwrap();
    let first_pid = client.pid();
    complete(&client, "ok");

    let err = client.completions(&request("boom")).unwrap_err();
    assert!(matches!(err, BackendError::Exited), "{err:?}");
    assert_ne!(client.pid(), first_pid);
    assert_eq!(client.restart_count(), 1);

    // The replacement serves the next request.
    assert_eq!(fact(&complete(&client, "again"), "served"), "1");
}

#[test]
fn malformed_frame_triggers_restart() {
    let client = BackendClient::spawn(helper().arg("--garbage-after").arg("0"), options()).unwrap();
    let err = client.completions(&request("x")).unwrap_err();
    assert!(
        matches!(err, BackendError::Protocol(ProtocolError::FrameTooLarge { .. })),
        "{err:?}"
    );
    assert_eq!(client.restart_count(), 1);
}

#[test]
fn interrupt_unblocks_a_hung_request() {
    let client = Arc::new(
        BackendClient::spawn(helper().arg("--hang-on").arg("HANG"), options()).unwrap(),
    );
    let hung_pid = client.pid();

    let worker = {
        let client = Arc::clone(&client);
        std::thread::spawn(move || client.completions(&request("HANG")))
    };
    std::thread::sleep(Duration::from_millis(100));
    client.interrupt();
    let result = worker.join().unwrap();
    assert!(result.is_err());
    assert_eq!(client.pid(), 0);

    client.restart().unwrap();
    assert_ne!(client.pid(), 0);
    assert_ne!(client.pid(), hung_pid);
    assert_eq!(fact(&complete(&client, "fine"), "served"), "1");
}
