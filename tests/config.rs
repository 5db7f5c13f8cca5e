//! Configuration Integration Tests
//!
//! Config file loading and manifest file parsing as the CLI sees them.

use std::time::Duration;

use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use steward::cli::run::load_manifests;
use steward::EngineConfig;

#[test]
fn test_explicit_config_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.yaml");
    std::fs::write(
        &path,
        r#"
version: "1"
reconcile:
  not_ready_retries: 3
  not_ready_delay_ms: 50
trigger_queue:
  document_name: build-queue
log:
  max_events: 100
"#,
    )
    .unwrap();

    let config = assert_ok!(EngineConfig::from_file(&path));
    assert_eq!(config.not_ready_retry.max_retries, 3);
    assert_eq!(config.not_ready_retry.delay, Duration::from_millis(50));
    assert_eq!(config.trigger_queue_name, "build-queue");
    assert_eq!(config.max_log_events, 100);
    assert_eq!(config.config_file.as_deref(), Some(path.as_path()));
}

#[test]
fn test_malformed_config_file_is_an_error() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.yaml");
    std::fs::write(&path, "reconcile: 5\n").unwrap();

    let err = assert_err!(EngineConfig::from_file(&path));
    assert!(err.to_string().contains("Failed to parse config file"));
}

#[test]
fn test_missing_config_file_is_an_error() {
    let temp = TempDir::new().unwrap();
    assert_err!(EngineConfig::from_file(&temp.path().join("absent.yaml")));
}

#[test]
fn test_manifest_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("manifests.yaml");
    std::fs::write(
        &path,
        r#"
manifests:
  - name: fe
    image_targets:
      - image_ref: gcr.io/project/frontend
        context: ./fe
    k8s_yaml: |
      kind: Deployment
    restart_on:
      ui_buttons: [fe-restart]
  - name: api
    local:
      serve_cmd:
        argv: [cargo, run]
        env: [PORT=8080]
"#,
    )
    .unwrap();

    let manifests = assert_ok!(load_manifests(&path));
    let names: Vec<&str> = manifests.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["fe", "api"]);
    assert!(manifests[0].is_k8s());
    assert!(manifests[1].is_local());
}

#[test]
fn test_manifest_file_rejects_duplicates() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("manifests.yaml");
    std::fs::write(&path, "manifests:\n  - name: fe\n  - name: fe\n").unwrap();

    let err = assert_err!(load_manifests(&path));
    assert!(format!("{:#}", err).contains("Duplicate manifest name: fe"));
}
