use std::path::PathBuf;

use kestrel_config::{ConfigError, KestrelConfig};

#[test]
fn loads_all_sections_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("kestrel.toml");
    std::fs::write(
        &path,
        r#"
[backend]
python_path = "/opt/py/bin/python3"
engine_path = ["/opt/engine"]
max_completions = 10

[workers]
count = 4
job_timeout_ms = 2500

[cache]
root = "/tmp/kestrel-cache"
persist = false
max_age_secs = 60

[dispatch]
wait_ms = 20
extra_path = ["/src/vendor"]

[logging]
level = "debug"
json = true
stderr = false
"#,
    )
    .expect("write config");

    let config = KestrelConfig::load_from_path(&path).expect("load config");
    assert_eq!(
        config.backend.python_path,
        Some(PathBuf::from("/opt/py/bin/python3"))
    );
    assert_eq!(config.backend.max_completions, 10);
    assert_eq!(config.workers.count, 4);
    assert_eq!(config.workers.job_timeout_ms, 2500);
    assert!(!config.cache.persist);
    assert_eq!(config.cache.max_age_secs, 60);
    assert_eq!(config.cache.reap_interval_secs, 300);
    assert_eq!(config.dispatch.wait_ms, 20);
    assert_eq!(config.dispatch.extra_path, vec![PathBuf::from("/src/vendor")]);
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.json);
    assert!(!config.logging.stderr);
}

#[test]
fn unknown_keys_are_rejected() {
    let err = KestrelConfig::load_from_str("[workers]\nthreads = 3\n").unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)), "{err:?}");
}

#[test]
fn missing_file_reports_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("absent.toml");
    let err = KestrelConfig::load_from_path(&path).unwrap_err();
    match err {
        ConfigError::Io { path: reported, .. } => assert!(reported.ends_with("absent.toml")),
        other => panic!("unexpected error: {other:?}"),
    }
}
