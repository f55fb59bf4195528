//! Tests for the exit status of the `train_xception` binary

use std::process::Command;
use tempfile::tempdir;

fn train_xception() -> Command {
    Command::new(env!("CARGO_BIN_EXE_train_xception"))
}

#[test]
fn test_training_failure_exits_normally() {
    let dir = tempdir().unwrap();
    let checkpoints = dir.path().join("checkpoints");

    let status = train_xception()
        .args(["--log-level", "off", "--batches-dir"])
        .arg(dir.path().join("no_batches_here"))
        .arg("--checkpoint-dir")
        .arg(&checkpoints)
        .status()
        .unwrap();

    assert!(status.success());
    assert!(checkpoints.join("model_trained_categorical.h5").exists());
}

#[test]
fn test_setup_error_exits_with_failure() {
    let dir = tempdir().unwrap();

    let status = train_xception()
        .args(["--log-level", "off", "--architecture"])
        .arg(dir.path().join("missing.json"))
        .arg("--batches-dir")
        .arg(dir.path())
        .status()
        .unwrap();

    assert_eq!(status.code(), Some(1));
}
