//! Runtime configuration loading and validation.

#![allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::time::Duration;
use tempfile::TempDir;
use toolhost_runtime::{load_runtime_config, RuntimeConfig, RuntimeError};

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("runtime.yaml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_partial_file_takes_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "log_filter: debug\nrelay:\n  batch_limit: 5\n");

    let config = load_runtime_config(&path).unwrap();

    assert_eq!(config.log_filter, "debug");
    assert_eq!(config.relay.batch_limit, 5);
    assert_eq!(config.relay.interval(), Duration::from_secs(1));
    assert_eq!(config.max_concurrent_requests, 64);
    assert_eq!(config.store.max_attempts, 10);
    assert!(config.events_log.is_none());
    assert!(!config.dispatcher.emit_not_found);
}

#[test]
fn test_relative_paths_resolve_against_config_dir() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "workspace_root: work\noutbox_path: state/outbox.db\nevents_log: /var/log/events.jsonl\n",
    );

    let config = load_runtime_config(&path).unwrap();

    assert_eq!(config.workspace_root, dir.path().join("work"));
    assert_eq!(config.outbox_path, dir.path().join("state/outbox.db"));
    assert_eq!(
        config.events_log.as_deref(),
        Some(std::path::Path::new("/var/log/events.jsonl"))
    );
}

#[test]
fn test_full_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
max_concurrent_requests: 8
dispatcher:
  default_timeout_ms: 2500
  emit_not_found: true
relay:
  interval_ms: 200
  throttle_ms: 10
  backoff:
    base_ms: 50
    factor: 3.0
    max_ms: 1000
store:
  max_attempts: 4
  retry_base_ms: 100
  retry_max_ms: 2000
"#,
    );

    let config = load_runtime_config(&path).unwrap();

    assert_eq!(config.max_concurrent_requests, 8);
    assert_eq!(
        config.dispatcher.default_timeout(),
        Some(Duration::from_millis(2500))
    );
    assert!(config.dispatcher.emit_not_found);
    assert_eq!(config.relay.throttle(), Some(Duration::from_millis(10)));
    let backoff = config.relay.backoff.policy();
    assert_eq!(backoff.factor, 3.0);
    assert_eq!(backoff.max, Duration::from_secs(1));
    let retry = config.store.retry_policy();
    assert_eq!(retry.max_attempts, 4);
    assert_eq!(retry.max_delay, Duration::from_secs(2));
}

#[test]
fn test_missing_file() {
    let dir = TempDir::new().unwrap();
    let err = load_runtime_config(dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, RuntimeError::ConfigError(msg) if msg.contains("not found")));
}

#[test]
fn test_empty_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "   \n");
    let err = load_runtime_config(&path).unwrap_err();
    assert!(matches!(err, RuntimeError::ConfigError(msg) if msg == "Config file is empty"));
}

#[test]
fn test_invalid_values_rejected() {
    let dir = TempDir::new().unwrap();
    for body in [
        "relay:\n  batch_limit: 0\n",
        "max_concurrent_requests: 0\n",
        "max_concurrent_requests: 18446744073709551615\n",
        "relay:\n  backoff:\n    factor: 0.5\n",
        "store:\n  max_attempts: 0\n",
    ] {
        let path = write_config(&dir, body);
        let err = load_runtime_config(&path).unwrap_err();
        assert!(matches!(err, RuntimeError::ConfigError(_)), "{body}");
    }
}

#[test]
fn test_unknown_keys_and_bad_yaml_rejected() {
    let dir = TempDir::new().unwrap();
    for body in ["relay_limit: 3\n", "relay: [unterminated\n"] {
        let path = write_config(&dir, body);
        let err = load_runtime_config(&path).unwrap_err();
        assert!(
            matches!(&err, RuntimeError::ConfigError(msg) if msg.starts_with("Invalid YAML")),
            "{body}: {err}"
        );
    }
}

#[test]
fn test_default_matches_empty_mapping() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "{}\n");
    let mut expected = RuntimeConfig::default();
    expected.workspace_root = dir.path().join(".");
    expected.outbox_path = dir.path().join("data/outbox.db");
    assert_eq!(load_runtime_config(&path).unwrap(), expected);
}

#[test]
fn test_loaded_filter_installs_subscriber_once() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "log_filter: toolhost_runtime=debug\n");

    let config = load_runtime_config(&path).unwrap();

    assert_eq!(config.log_filter, "toolhost_runtime=debug");
    assert!(config.init_tracing());
    assert!(!config.init_tracing());
}
