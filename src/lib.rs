//! Multi-slice Xception classifier
//!
//! A truncated Xception-style convolutional network that classifies a
//! sample made of three image slices. One feature extractor, with a single
//! set of weights, is applied to every slice; each slice then gets its own
//! dense softmax head and the three class distributions are summed.
//!
//! # Modules
//!
//! - `tensor`: dense NHWC tensors
//! - `layers`: Layer trait and implementations (Conv2D, SeparableConv2D, BatchNorm, ...)
//! - `graph`: layer graphs with residual sums, forward traces and backprop
//! - `architecture`: stage configuration and feature-extractor construction
//! - `backend`: compute backend capability checks and data format resolution
//! - `model`: the three-slice model, compile/train/evaluate/predict
//! - `loss`: categorical cross-entropy, accuracy and one-hot encoding
//! - `optimizers`: Optimizer trait and implementations (Adadelta, Adam, SGD)
//! - `checkpoint`: binary model checkpoints
//! - `config`: training configuration
//! - `trainer`: epoch/batch driver with periodic and failure checkpoints
//! - `utils`: shared utilities (RNG, activation functions)

pub mod architecture;
pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod graph;
pub mod layers;
pub mod loss;
pub mod model;
pub mod optimizers;
pub mod tensor;
pub mod trainer;
pub mod utils;

pub use architecture::ArchitectureConfig;
pub use backend::{Backend, CpuBackend, DataFormat};
pub use config::TrainingConfig;
pub use error::{ModelError, Result};
pub use model::{CompileOptions, ModelOptions, Weights, XceptionModel};
pub use tensor::Tensor;
pub use trainer::{Batch, BatchSource, FileBatchSource, Trainer, TrainingReport, VecBatchSource};
