//! Tests for training configuration parsing
//!
//! This file covers:
//! - Loading the shipped config/training.json
//! - Defaults for missing fields
//! - Invalid values, invalid JSON and missing files

use multislice_xception::config::{load_config, TrainingConfig};
use multislice_xception::ModelError;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

fn write_temp_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("failed to write temp config");
    file
}

#[test]
fn test_load_shipped_training_config() {
    let config = load_config("config/training.json").expect("Failed to load training config");

    assert_eq!(config.epochs, 5);
    assert_eq!(config.checkpoint_interval, 20);
    assert_eq!(config.num_classes, 40);
    assert_eq!(config.optimizer.name, "adadelta");
    assert_eq!(config.optimizer.learning_rate, Some(1.0));
    assert_eq!(config.optimizer.rho, Some(0.95));
    assert_eq!(config.loss, "categorical_crossentropy");
    assert_eq!(config.metrics, vec!["accuracy"]);
    assert_eq!(
        config.checkpoint_path(20),
        Path::new("checkpoints").join("model_checkpoint20.h5")
    );
}

#[test]
fn test_empty_object_uses_defaults() {
    let file = write_temp_config("{}");
    let config = load_config(file.path()).unwrap();
    assert_eq!(config, TrainingConfig::default());
    assert_eq!(config.failure_path(), Path::new(".").join("model_trained_categorical.h5"));
}

#[test]
fn test_partial_optimizer_section() {
    let file = write_temp_config(r#"{ "optimizer": { "name": "sgd", "learning_rate": 0.05 } }"#);
    let config = load_config(file.path()).unwrap();
    assert_eq!(config.optimizer.name, "sgd");
    assert_eq!(config.optimizer.learning_rate, Some(0.05));
    assert_eq!(config.optimizer.momentum, None);
    assert_eq!(config.epochs, 5);
}

#[test]
fn test_rejects_invalid_values() {
    for json in [
        r#"{ "epochs": 0 }"#,
        r#"{ "checkpoint_interval": 0 }"#,
        r#"{ "num_classes": 0 }"#,
        r#"{ "optimizer": { "name": "rmsprop" } }"#,
        r#"{ "optimizer": { "name": "adadelta", "rho": 1.5 } }"#,
        r#"{ "loss": "mean_squared_error" }"#,
        r#"{ "metrics": ["precision"] }"#,
        r#"{ "checkpoint_prefix": "" }"#,
    ] {
        let file = write_temp_config(json);
        let result = load_config(file.path());
        assert!(matches!(result, Err(ModelError::Config(_))), "{} should be rejected", json);
    }
}

#[test]
fn test_invalid_json() {
    let file = write_temp_config("{ epochs: 5 }");
    assert!(matches!(load_config(file.path()), Err(ModelError::Serialization(_))));
}

#[test]
fn test_wrong_field_type() {
    let file = write_temp_config(r#"{ "epochs": "five" }"#);
    assert!(matches!(load_config(file.path()), Err(ModelError::Serialization(_))));
}

#[test]
fn test_missing_file() {
    assert!(matches!(
        load_config("config/does_not_exist.json"),
        Err(ModelError::Io(_))
    ));
}
