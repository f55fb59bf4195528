//! Multi-slice Xception model
//!
//! The input batch carries three views (slices) of every image. One shared
//! feature extractor is applied to each slice, each result goes through its
//! own softmax head, and the three head outputs are summed.
//!
//! ```text
//! (B, 3, H, W, 3) ─┬─ slice 0 ─ model_c ─ predictions0 ─┐
//!                  ├─ slice 1 ─ model_c ─ predictions1 ─┼─ add ─ add ─ (B, classes)
//!                  └─ slice 2 ─ model_c ─ predictions2 ─┘
//! ```

use crate::architecture::{build_feature_extractor, build_head, ArchitectureConfig, ExtractorTop};
use crate::backend::{self, Backend, Primitive, Resolution};
use crate::checkpoint::{self, Checkpoint};
use crate::error::{config_error, ModelError, Result};
use crate::graph::{Graph, Trace};
use crate::layers::{FeatureShape, PoolMode};
use crate::loss::{Loss, Metric};
use crate::optimizers::{build_optimizer, Optimizer, OptimizerConfig};
use crate::tensor::Tensor;
use crate::utils::SimpleRng;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Number of views per input sample.
pub const NUM_SLICES: usize = 3;
/// Default `(slices, height, width, channels)` input shape.
pub const DEFAULT_INPUT_SHAPE: [usize; 4] = [NUM_SLICES, 80, 320, 3];
pub const DEFAULT_NUM_CLASSES: usize = 40;

/// Initial weights of a freshly built model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Weights {
    /// Random initialisation from `ModelOptions::seed`
    #[default]
    None,
    /// A named pretrained weight set. None ship with this crate, so
    /// requesting one is a configuration error.
    Pretrained(String),
    /// Restore parameters from a checkpoint file after construction
    Checkpoint(PathBuf),
}

/// Construction options of [`XceptionModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    /// Build the per-slice classification heads
    pub include_top: bool,
    pub weights: Weights,
    /// `(slices, height, width, channels)`; `None` uses [`DEFAULT_INPUT_SHAPE`]
    pub input_shape: Option<[usize; 4]>,
    /// Global pooling of the extractor output when `include_top` is false
    pub pooling: Option<PoolMode>,
    pub name: String,
    pub seed: u64,
    pub num_classes: usize,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            include_top: true,
            weights: Weights::None,
            input_shape: None,
            pooling: None,
            name: "xception".to_string(),
            seed: 42,
            num_classes: DEFAULT_NUM_CLASSES,
        }
    }
}

/// Optimizer, loss and metrics used by [`XceptionModel::train_step`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileOptions {
    pub optimizer: OptimizerConfig,
    pub loss: String,
    pub metrics: Vec<String>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            optimizer: OptimizerConfig::default(),
            loss: "categorical_crossentropy".to_string(),
            metrics: vec!["accuracy".to_string()],
        }
    }
}

/// Loss and metrics of one training or evaluation step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub loss: f32,
    /// Present when the model was compiled with the accuracy metric
    pub accuracy: Option<f32>,
}

/// Activations of one slice pass, kept for back-propagation.
struct SliceTrace {
    features: Trace,
    head: Option<Trace>,
}

pub struct XceptionModel {
    name: String,
    architecture: ArchitectureConfig,
    options: ModelOptions,
    input_shape: [usize; 4],
    extractor: Graph,
    heads: Vec<Graph>,
    resolution: Resolution,
    compile: CompileOptions,
    optimizer: Box<dyn Optimizer>,
    loss: Loss,
    metrics: Vec<Metric>,
    training: Option<bool>,
}

impl XceptionModel {
    /// Builds the model for `architecture` on `backend`.
    ///
    /// The model is compiled with [`CompileOptions::default`] (Adadelta,
    /// categorical cross-entropy, accuracy); call [`XceptionModel::compile`]
    /// to change that.
    ///
    /// # Errors
    ///
    /// - [`ModelError::Backend`] if the backend lacks a primitive the
    ///   topology uses
    /// - [`ModelError::Config`] for invalid options or a requested
    ///   pretrained weight set
    /// - checkpoint errors when `options.weights` names a checkpoint that
    ///   cannot be loaded into this topology
    pub fn build(
        architecture: &ArchitectureConfig,
        options: ModelOptions,
        backend: &dyn Backend,
    ) -> Result<Self> {
        validate_options(&options)?;
        let resolution = backend::resolve(backend, &required_primitives(architecture, &options))?;

        let input_shape = options.input_shape.unwrap_or(DEFAULT_INPUT_SHAPE);
        let image = FeatureShape::map(input_shape[1], input_shape[2], input_shape[3]);

        let mut rng = SimpleRng::new(options.seed);
        let top = if options.include_top {
            ExtractorTop::Classifier(architecture.feature_units.unwrap_or(options.num_classes))
        } else {
            ExtractorTop::Pooling(options.pooling)
        };
        let extractor = build_feature_extractor(architecture, image, top, &mut rng)?;

        let mut heads = Vec::new();
        if options.include_top {
            for slice in 0..NUM_SLICES {
                heads.push(build_head(
                    &format!("predictions{}", slice),
                    extractor.output_shape(),
                    options.num_classes,
                    &mut rng,
                )?);
            }
        }

        let compile = CompileOptions::default();
        let mut model = Self {
            name: options.name.clone(),
            architecture: architecture.clone(),
            input_shape,
            extractor,
            heads,
            resolution,
            optimizer: build_optimizer(&compile.optimizer)?,
            loss: Loss::from_name(&compile.loss)?,
            metrics: parse_metrics(&compile.metrics)?,
            compile,
            training: None,
            options,
        };

        if let Weights::Checkpoint(path) = model.options.weights.clone() {
            let checkpoint = checkpoint::load_checkpoint(&path)?;
            model.load_state_dict(&checkpoint.state)?;
            info!("{}: restored weights from {}", model.name, path.display());
        }

        info!(
            "Built model '{}' ({} parameters, extractor '{}' with {} layers, backend '{}')",
            model.name,
            model.parameter_count(),
            model.extractor.name(),
            model.extractor.layer_names().len(),
            backend.name()
        );
        Ok(model)
    }

    /// Rebuilds a model from a checkpoint file, including its architecture
    /// and options.
    pub fn load(path: &Path, backend: &dyn Backend) -> Result<Self> {
        let checkpoint = checkpoint::load_checkpoint(path)?;
        let options = ModelOptions {
            weights: Weights::None,
            ..checkpoint.options.clone()
        };
        let mut model = Self::build(&checkpoint.architecture, options, backend)?;
        model.load_state_dict(&checkpoint.state)?;
        Ok(model)
    }

    /// Writes every parameter and moving statistic to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let checkpoint = Checkpoint::new(
            &self.name,
            self.architecture.clone(),
            ModelOptions {
                weights: Weights::None,
                ..self.options.clone()
            },
            self.state_dict(),
        );
        checkpoint::save_checkpoint(path, &checkpoint)
    }

    /// Replaces optimizer, loss and metrics. Optimizer state starts fresh.
    pub fn compile(&mut self, options: CompileOptions) -> Result<()> {
        self.optimizer = build_optimizer(&options.optimizer)?;
        self.loss = Loss::from_name(&options.loss)?;
        self.metrics = parse_metrics(&options.metrics)?;
        debug!(
            "{}: compiled with optimizer={} loss={} metrics={:?}",
            self.name,
            self.optimizer.name(),
            self.loss.name(),
            options.metrics
        );
        self.compile = options;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn architecture(&self) -> &ArchitectureConfig {
        &self.architecture
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    pub fn compile_options(&self) -> &CompileOptions {
        &self.compile
    }

    pub fn num_classes(&self) -> usize {
        self.options.num_classes
    }

    /// `(slices, height, width, channels)` of one input sample.
    pub fn input_shape(&self) -> [usize; 4] {
        self.input_shape
    }

    /// Output shape for a batch of `batch_size` samples.
    pub fn output_shape(&self, batch_size: usize) -> Vec<usize> {
        let per_sample = match self.heads.first() {
            Some(head) => head.output_shape(),
            None => self.extractor.output_shape(),
        };
        let mut shape = vec![batch_size];
        shape.extend(per_sample.dims());
        shape
    }

    /// The shared feature extractor.
    pub fn extractor(&self) -> &Graph {
        &self.extractor
    }

    /// Per-slice classification heads; empty without the top.
    pub fn heads(&self) -> &[Graph] {
        &self.heads
    }

    /// Whether the backend asked for channels-first and was overridden.
    pub fn layout_overridden(&self) -> bool {
        self.resolution.layout_overridden
    }

    /// Trainable parameters; the shared extractor is counted once.
    pub fn parameter_count(&self) -> usize {
        self.extractor.parameter_count() + self.heads.iter().map(Graph::parameter_count).sum::<usize>()
    }

    fn set_training(&mut self, training: bool) {
        if self.training != Some(training) {
            self.extractor.set_training(training);
            for head in &mut self.heads {
                head.set_training(training);
            }
            self.training = Some(training);
        }
    }

    /// Batches must hold at least one sample.
    fn check_input(&self, images: &Tensor) -> Result<usize> {
        let batch = images.batch_size();
        let mut expected = vec![batch.max(1)];
        expected.extend_from_slice(&self.input_shape);
        if images.shape() != expected.as_slice() {
            return Err(ModelError::Shape {
                expected,
                actual: images.shape().to_vec(),
            });
        }
        Ok(batch)
    }

    fn run(&self, images: &Tensor) -> Result<(Vec<SliceTrace>, Tensor)> {
        let batch = self.check_input(images)?;
        let mut combined = Tensor::zeros(&self.output_shape(batch));
        let mut traces = Vec::with_capacity(NUM_SLICES);

        for slice in 0..NUM_SLICES {
            let view = images.slice_axis1(slice)?;
            let features = self.extractor.forward(view.data(), batch)?;
            let head = match self.heads.get(slice) {
                Some(head) => Some(head.forward(features.output(), batch)?),
                None => None,
            };
            let output = head.as_ref().unwrap_or(&features).output();
            let output = Tensor::from_vec(combined.shape(), output.to_vec())?;
            combined.add_assign(&output)?;
            traces.push(SliceTrace { features, head });
        }
        Ok((traces, combined))
    }

    /// Forward pass in training mode (batch statistics, moving averages
    /// updated).
    pub fn forward(&mut self, images: &Tensor) -> Result<Tensor> {
        self.set_training(true);
        Ok(self.run(images)?.1)
    }

    /// Forward pass in inference mode (moving statistics).
    pub fn predict(&mut self, images: &Tensor) -> Result<Tensor> {
        self.set_training(false);
        Ok(self.run(images)?.1)
    }

    fn score(&self, predictions: &Tensor, targets: &[f32]) -> Result<(f32, Vec<f32>, Option<f32>)> {
        let classes = self.num_classes();
        let (loss, grad) = self.loss.compute(predictions.data(), targets, classes)?;
        let accuracy = self
            .metrics
            .iter()
            .find(|m| **m == Metric::Accuracy)
            .map(|m| m.compute(predictions.data(), targets, classes));
        Ok((loss, grad, accuracy))
    }

    /// One optimisation step on a batch.
    ///
    /// `targets` holds one-hot rows, `batch × num_classes`. The loss gradient
    /// flows through each head and then through the shared extractor once
    /// per slice; a single optimizer update follows.
    pub fn train_step(&mut self, images: &Tensor, targets: &[f32]) -> Result<BatchMetrics> {
        if self.heads.is_empty() {
            return Err(config_error("training requires the classification top (include_top)"));
        }
        self.set_training(true);
        let (traces, predictions) = self.run(images)?;
        let (loss, grad, accuracy) = self.score(&predictions, targets)?;

        for (slice, trace) in traces.iter().enumerate() {
            if let Some(head_trace) = &trace.head {
                let grad_features = self.heads[slice].backward(head_trace, &grad)?;
                self.extractor.backward(&trace.features, &grad_features)?;
            }
        }

        self.extractor.update_with_optimizer(self.optimizer.as_mut());
        for head in &mut self.heads {
            head.update_with_optimizer(self.optimizer.as_mut());
        }

        Ok(BatchMetrics { loss, accuracy })
    }

    /// Loss and metrics in inference mode, without updating anything.
    pub fn evaluate(&mut self, images: &Tensor, targets: &[f32]) -> Result<BatchMetrics> {
        let predictions = self.predict(images)?;
        let (loss, _, accuracy) = self.score(&predictions, targets)?;
        Ok(BatchMetrics { loss, accuracy })
    }

    /// Every parameter and moving statistic, keyed `"<layer>/<buffer>"`.
    pub fn state_dict(&self) -> BTreeMap<String, Vec<f32>> {
        let mut state: BTreeMap<String, Vec<f32>> = self.extractor.state().into_iter().collect();
        for head in &self.heads {
            state.extend(head.state());
        }
        state
    }

    /// Restores buffers written by [`XceptionModel::state_dict`].
    ///
    /// # Errors
    ///
    /// Fails with [`ModelError::Checkpoint`] on missing, extra or
    /// wrongly-sized buffers.
    pub fn load_state_dict(&mut self, state: &BTreeMap<String, Vec<f32>>) -> Result<()> {
        let own = self.state_dict();
        if let Some(extra) = state.keys().find(|key| !own.contains_key(*key)) {
            return Err(ModelError::Checkpoint(format!(
                "unexpected buffer '{}' for model '{}'",
                extra, self.name
            )));
        }
        self.extractor.load_state(state)?;
        for head in &mut self.heads {
            head.load_state(state)?;
        }
        Ok(())
    }
}

fn validate_options(options: &ModelOptions) -> Result<()> {
    if let Weights::Pretrained(name) = &options.weights {
        return Err(config_error(format!(
            "pretrained weights '{}' are not available; use Weights::None or Weights::Checkpoint",
            name
        )));
    }
    if options.num_classes == 0 {
        return Err(config_error("num_classes must be greater than 0"));
    }
    if options.name.is_empty() {
        return Err(config_error("model name must not be empty"));
    }
    if let Some([slices, height, width, channels]) = options.input_shape {
        if slices != NUM_SLICES {
            return Err(config_error(format!(
                "input_shape must have {} slices, got {}",
                NUM_SLICES, slices
            )));
        }
        if channels != 3 {
            return Err(config_error(format!(
                "input_shape must have exactly 3 channels, got {}",
                channels
            )));
        }
        if height == 0 || width == 0 {
            return Err(config_error("input_shape height and width must be positive"));
        }
    }
    Ok(())
}

fn parse_metrics(names: &[String]) -> Result<Vec<Metric>> {
    names.iter().map(|name| Metric::from_name(name)).collect()
}

/// Primitives the topology built from `architecture` and `options` uses.
fn required_primitives(architecture: &ArchitectureConfig, options: &ModelOptions) -> Vec<Primitive> {
    let mut required = vec![Primitive::Conv2D, Primitive::BatchNorm];
    let has = |stage_type: &str| {
        architecture
            .stages
            .iter()
            .any(|s| s.stage_type.eq_ignore_ascii_case(stage_type))
    };
    if has("separable_conv") || has("residual_block") {
        required.push(Primitive::SeparableConv2D);
    }
    if architecture
        .stages
        .iter()
        .any(|s| s.stage_type.eq_ignore_ascii_case("residual_block") && s.pool.unwrap_or(true))
    {
        required.push(Primitive::MaxPooling2D);
    }
    if options.include_top || options.pooling.is_some() {
        required.push(Primitive::GlobalPooling2D);
    }
    if options.include_top {
        required.push(Primitive::Dense);
    }
    required
}
