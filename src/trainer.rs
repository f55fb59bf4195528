//! Batch training driver
//!
//! Runs a fixed number of epochs over a [`BatchSource`], taking one
//! optimisation step per batch and writing periodic checkpoints. Any error
//! while iterating ends the run: the model is saved once more to the failure
//! checkpoint and the error is reported in the [`TrainingReport`] instead of
//! being propagated.
//!
//! ```text
//! Idle → EpochRunning ⇄ BatchFit → Checkpointing → EpochRunning ...
//!            │              │            │
//!            └──────────────┴────────────┴─→ Failed → Terminated
//! EpochRunning (all epochs done) → Terminated
//! ```

use crate::checkpoint::{read_bincode, write_bincode};
use crate::config::{validate_config, TrainingConfig};
use crate::error::{config_error, ModelError, Result};
use crate::loss::to_categorical;
use crate::model::{BatchMetrics, XceptionModel};
use crate::tensor::Tensor;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One unit of work pulled from a batch source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// `(batch, slices, height, width, channels)`
    pub train_images: Tensor,
    pub train_labels: Vec<usize>,
    pub test_images: Tensor,
    pub test_labels: Vec<usize>,
}

/// Supplier of training batches. Each call to `batches` starts a new epoch;
/// exhaustion of the returned iterator ends it.
pub trait BatchSource {
    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;
}

/// Replays the same in-memory batches every epoch.
#[derive(Debug, Clone, Default)]
pub struct VecBatchSource {
    batches: Vec<Batch>,
}

impl VecBatchSource {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches }
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

impl BatchSource for VecBatchSource {
    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(self.batches.iter().cloned().map(Ok::<Batch, ModelError>))
    }
}

/// Reads bincode-encoded [`Batch`] files from a directory, in file-name
/// order. The directory is listed again at the start of every epoch.
#[derive(Debug, Clone)]
pub struct FileBatchSource {
    dir: PathBuf,
    extension: String,
}

impl FileBatchSource {
    pub const DEFAULT_EXTENSION: &'static str = "batch";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            extension: Self::DEFAULT_EXTENSION.to_string(),
        }
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.to_string();
        self
    }

    /// Writes `batch` as `batch_<index>.<extension>` into `dir`.
    pub fn write_batch(dir: &Path, index: usize, batch: &Batch) -> Result<PathBuf> {
        let path = dir.join(format!("batch_{:06}.{}", index, Self::DEFAULT_EXTENSION));
        write_bincode(&path, batch)?;
        Ok(path)
    }

    fn list(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == self.extension.as_str()) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl BatchSource for FileBatchSource {
    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        match self.list() {
            Ok(files) => {
                debug!("{}: {} batch files", self.dir.display(), files.len());
                Box::new(files.into_iter().map(|path| {
                    read_bincode::<Batch>(&path).map_err(|e| {
                        ModelError::BatchSource(format!("{}: {}", path.display(), e))
                    })
                }))
            }
            Err(e) => Box::new(std::iter::once(Err::<Batch, _>(ModelError::BatchSource(format!(
                "cannot list {}: {}",
                self.dir.display(),
                e
            ))))),
        }
    }
}

/// Where the driver is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainerState {
    Idle,
    EpochRunning,
    BatchFit,
    Checkpointing,
    Terminated,
    Failed,
}

/// Metrics of one processed batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub epoch: usize,
    /// Global batch counter after this batch (1-based, never reset)
    pub batch: usize,
    pub train: BatchMetrics,
    pub test: Option<BatchMetrics>,
}

/// Summary of a [`Trainer::run`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub epochs_completed: usize,
    pub batches_processed: usize,
    /// Periodic checkpoints, in the order they were written
    pub checkpoints: Vec<PathBuf>,
    /// Error that ended the run early
    pub failure: Option<String>,
    /// Failure checkpoint, written only when the run failed
    pub emergency_checkpoint: Option<PathBuf>,
    pub history: Vec<BatchRecord>,
}

impl TrainingReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct Trainer {
    model: XceptionModel,
    config: TrainingConfig,
    state: TrainerState,
    batch_count: usize,
}

impl Trainer {
    /// Compiles `model` with the optimizer, loss and metrics of `config`.
    ///
    /// # Errors
    ///
    /// Invalid configuration, or a class count that differs from the model's.
    pub fn new(mut model: XceptionModel, config: TrainingConfig) -> Result<Self> {
        validate_config(&config)?;
        if config.num_classes != model.num_classes() {
            return Err(config_error(format!(
                "training config has {} classes, model '{}' has {}",
                config.num_classes,
                model.name(),
                model.num_classes()
            )));
        }
        model.compile(config.compile_options())?;
        Ok(Self {
            model,
            config,
            state: TrainerState::Idle,
            batch_count: 0,
        })
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &XceptionModel {
        &self.model
    }

    pub fn into_model(self) -> XceptionModel {
        self.model
    }

    fn transition(&mut self, next: TrainerState) {
        if self.state != next {
            debug!("trainer: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Trains for `config.epochs` epochs over `source`.
    ///
    /// # Errors
    ///
    /// Training errors are captured in the report. Only a failure to write
    /// the failure checkpoint itself is returned as an error.
    pub fn run(&mut self, source: &mut dyn BatchSource) -> Result<TrainingReport> {
        let mut report = TrainingReport::default();

        match self.run_epochs(source, &mut report) {
            Ok(()) => {
                self.transition(TrainerState::Terminated);
                info!(
                    "Training finished: {} epochs, {} batches, {} checkpoints",
                    report.epochs_completed,
                    report.batches_processed,
                    report.checkpoints.len()
                );
            }
            Err(err) => {
                self.transition(TrainerState::Failed);
                error!("Excepted with {}", err);
                let path = self.config.failure_path();
                info!("Saving model to {}", path.display());
                self.model.save(&path)?;
                info!("Model saved.");
                report.batches_processed = self.batch_count;
                report.failure = Some(err.to_string());
                report.emergency_checkpoint = Some(path);
                self.transition(TrainerState::Terminated);
            }
        }
        Ok(report)
    }

    fn run_epochs(&mut self, source: &mut dyn BatchSource, report: &mut TrainingReport) -> Result<()> {
        for epoch in 0..self.config.epochs {
            self.transition(TrainerState::EpochRunning);
            info!("----------- On Epoch: {} ----------", epoch);

            for batch in source.batches() {
                let batch = batch?;
                self.transition(TrainerState::BatchFit);
                let record = self.fit_batch(epoch, &batch)?;
                report.history.push(record);
                report.batches_processed = self.batch_count;

                if self.batch_count % self.config.checkpoint_interval == 0 {
                    self.transition(TrainerState::Checkpointing);
                    let path = self.config.checkpoint_path(self.batch_count);
                    info!("Saving checkpoint {}", self.batch_count);
                    self.model.save(&path)?;
                    report.checkpoints.push(path);
                    info!("Checkpoint saved. Continuing...");
                }
                self.transition(TrainerState::EpochRunning);
            }
            report.epochs_completed = epoch + 1;
        }
        Ok(())
    }

    fn fit_batch(&mut self, epoch: usize, batch: &Batch) -> Result<BatchRecord> {
        let classes = self.config.num_classes;
        check_labels(&batch.train_images, &batch.train_labels)?;
        let targets = to_categorical(&batch.train_labels, classes)?;
        debug!(
            "x_train.shape {:?}, y_train.shape [{}, {}]",
            batch.train_images.shape(),
            batch.train_labels.len(),
            classes
        );

        let train = self.model.train_step(&batch.train_images, &targets)?;
        self.batch_count += 1;

        let test = if self.config.evaluate && !batch.test_labels.is_empty() {
            check_labels(&batch.test_images, &batch.test_labels)?;
            let test_targets = to_categorical(&batch.test_labels, classes)?;
            Some(self.model.evaluate(&batch.test_images, &test_targets)?)
        } else {
            None
        };

        info!("batch {}: {}", self.batch_count, format_metrics(&train, test.as_ref()));

        Ok(BatchRecord {
            epoch,
            batch: self.batch_count,
            train,
            test,
        })
    }
}

fn check_labels(images: &Tensor, labels: &[usize]) -> Result<()> {
    if images.batch_size() != labels.len() {
        return Err(ModelError::Shape {
            expected: vec![images.batch_size()],
            actual: vec![labels.len()],
        });
    }
    Ok(())
}

fn format_metrics(train: &BatchMetrics, test: Option<&BatchMetrics>) -> String {
    let mut line = format!("loss={:.4}", train.loss);
    if let Some(acc) = train.accuracy {
        line.push_str(&format!(" acc={:.4}", acc));
    }
    if let Some(test) = test {
        line.push_str(&format!(" val_loss={:.4}", test.loss));
        if let Some(acc) = test.accuracy {
            line.push_str(&format!(" val_acc={:.4}", acc));
        }
    }
    line
}
