//! Configuration structures for training
//!
//! Training runs are configured from JSON: epoch count, checkpoint cadence
//! and file names, and the optimizer/loss/metrics the model is compiled with.

use crate::error::{config_error, Result};
use crate::loss::{Loss, Metric};
use crate::model::{CompileOptions, DEFAULT_NUM_CLASSES};
use crate::optimizers::{build_optimizer, OptimizerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration of a training run.
///
/// Every field has a default, so `{}` is a valid configuration: five epochs,
/// a checkpoint every 20 batches, 40 classes, Adadelta with categorical
/// cross-entropy and accuracy, files written to the working directory.
///
/// # Example
///
/// ```json
/// {
///   "epochs": 5,
///   "checkpoint_interval": 20,
///   "num_classes": 40,
///   "optimizer": { "name": "adadelta", "learning_rate": 1.0 },
///   "loss": "categorical_crossentropy",
///   "metrics": ["accuracy"],
///   "checkpoint_dir": "checkpoints"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Number of passes over the batch source
    pub epochs: usize,
    /// Save a checkpoint whenever the global batch counter is a multiple of this
    pub checkpoint_interval: usize,
    pub num_classes: usize,
    pub optimizer: OptimizerConfig,
    pub loss: String,
    pub metrics: Vec<String>,
    /// Evaluate each batch's test split after the training step
    pub evaluate: bool,
    /// Directory periodic and failure checkpoints are written to
    pub checkpoint_dir: PathBuf,
    /// Periodic checkpoints are named `<prefix><batch count>.h5`
    pub checkpoint_prefix: String,
    /// File name of the checkpoint written when training fails
    pub failure_checkpoint: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 5,
            checkpoint_interval: 20,
            num_classes: DEFAULT_NUM_CLASSES,
            optimizer: OptimizerConfig::default(),
            loss: "categorical_crossentropy".to_string(),
            metrics: vec!["accuracy".to_string()],
            evaluate: true,
            checkpoint_dir: PathBuf::from("."),
            checkpoint_prefix: "model_checkpoint".to_string(),
            failure_checkpoint: "model_trained_categorical.h5".to_string(),
        }
    }
}

impl TrainingConfig {
    /// Optimizer, loss and metrics to compile the model with.
    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            optimizer: self.optimizer.clone(),
            loss: self.loss.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Path of the periodic checkpoint taken after `batch_count` batches.
    pub fn checkpoint_path(&self, batch_count: usize) -> PathBuf {
        self.checkpoint_dir
            .join(format!("{}{}.h5", self.checkpoint_prefix, batch_count))
    }

    /// Path of the checkpoint written when training fails.
    pub fn failure_path(&self) -> PathBuf {
        self.checkpoint_dir.join(&self.failure_checkpoint)
    }
}

/// Loads a training configuration from a JSON file.
///
/// Reads the file at `path`, deserializes it and validates the values.
///
/// # Examples
///
/// ```no_run
/// use multislice_xception::config::load_config;
///
/// let cfg = load_config("config/training.json").unwrap();
/// assert_eq!(cfg.checkpoint_interval, 20);
/// ```
pub fn load_config(path: impl AsRef<Path>) -> Result<TrainingConfig> {
    let contents = fs::read_to_string(path)?;
    let config: TrainingConfig = serde_json::from_str(&contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Checks ranges and names of a training configuration.
pub fn validate_config(config: &TrainingConfig) -> Result<()> {
    if config.epochs == 0 {
        return Err(config_error("epochs must be greater than 0"));
    }
    if config.checkpoint_interval == 0 {
        return Err(config_error("checkpoint_interval must be greater than 0"));
    }
    if config.num_classes == 0 {
        return Err(config_error("num_classes must be greater than 0"));
    }
    if config.checkpoint_prefix.is_empty() {
        return Err(config_error("checkpoint_prefix must not be empty"));
    }
    if config.failure_checkpoint.is_empty() {
        return Err(config_error("failure_checkpoint must not be empty"));
    }

    build_optimizer(&config.optimizer)?;
    Loss::from_name(&config.loss)?;
    for metric in &config.metrics {
        Metric::from_name(metric)?;
    }

    Ok(())
}
