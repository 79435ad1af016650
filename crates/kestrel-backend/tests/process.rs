use std::time::Duration;

use kestrel_core::{CacheKey, RequestOptions};
use kestrel_process::{BackendClient, BackendCommand, ClientOptions};
use kestrel_remote_proto::CompletionRequest;

fn client() -> BackendClient {
    BackendClient::spawn(
        BackendCommand::new(env!("CARGO_BIN_EXE_kestrel-backend")),
        ClientOptions {
            max_completions: 50,
            handshake_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_millis(100),
        },
    )
    .expect("backend should start")
}

#[test]
fn backend_binary_serves_module_completions() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("colors.py"),
        "RED = 1\nGREEN = 2\n\ndef blend(a, b):\n    pass\n",
    )
    .unwrap();
    let buffer = dir.path().join("main.py");
    let source = "import colors\ncolors.";
    std::fs::write(&buffer, source).unwrap();

    let client = client();
    assert_eq!(
        client.engine_version().map(|engine| engine.name),
        Some("kestrel-lexical".to_owned())
    );

    let request = CompletionRequest {
        cache_key: CacheKey::Local {
            module: "colors".into(),
        },
        dependencies: vec![buffer.clone()],
        source: source.into(),
        line: 2,
        column: 7,
        filename: Some(buffer),
        options: Some(RequestOptions::default()),
    };
    let out = client.completions(&request).unwrap().unwrap();
    let names: Vec<_> = out.iter().map(|candidate| candidate.name.as_str()).collect();
    assert_eq!(names, vec!["RED", "GREEN", "blend"]);
    assert_eq!(out[2].params, Some(vec!["a".to_string(), "b".to_string()]));
}
