//! End-to-end tests of the three-slice model
//!
//! This file covers:
//! - Output shapes and the summed per-slice distributions
//! - Weight sharing of the feature extractor and independence of the heads
//! - Training, evaluation and checkpoint round trips
//! - Backend capability and data format handling

use approx::assert_relative_eq;
use multislice_xception::architecture::{ArchitectureConfig, StageConfig};
use multislice_xception::backend::{Backend, Primitive};
use multislice_xception::loss::to_categorical;
use multislice_xception::optimizers::OptimizerConfig;
use multislice_xception::utils::SimpleRng;
use multislice_xception::{
    CompileOptions, CpuBackend, DataFormat, ModelError, ModelOptions, Tensor, Weights, XceptionModel,
};
use tempfile::tempdir;

const CLASSES: usize = 4;

fn tiny_options() -> ModelOptions {
    ModelOptions {
        input_shape: Some([3, 10, 14, 3]),
        num_classes: CLASSES,
        ..ModelOptions::default()
    }
}

fn tiny_model() -> XceptionModel {
    XceptionModel::build(&ArchitectureConfig::shallow(), tiny_options(), &CpuBackend::new()).unwrap()
}

fn random_images(batch: usize, shape: [usize; 4], seed: u64) -> Tensor {
    let mut rng = SimpleRng::new(seed);
    let mut dims = vec![batch];
    dims.extend_from_slice(&shape);
    let len: usize = dims.iter().product();
    let data = (0..len).map(|_| rng.next_f32()).collect();
    Tensor::from_vec(&dims, data).unwrap()
}

fn assert_rows_sum_to(predictions: &Tensor, expected: f32) {
    let classes = predictions.shape()[1];
    for row in predictions.data().chunks_exact(classes) {
        assert_relative_eq!(row.iter().sum::<f32>(), expected, epsilon = 1e-4);
    }
}

struct NoSeparableBackend;

impl Backend for NoSeparableBackend {
    fn name(&self) -> &str {
        "no-separable"
    }

    fn supports(&self, primitive: Primitive) -> bool {
        primitive != Primitive::SeparableConv2D
    }
}

// ============================================================================
// Shapes and Outputs
// ============================================================================

#[test]
fn test_full_size_output_shape() {
    let mut model = XceptionModel::build(
        &ArchitectureConfig::shallow(),
        ModelOptions::default(),
        &CpuBackend::new(),
    )
    .unwrap();
    assert_eq!(model.input_shape(), [3, 80, 320, 3]);
    assert_eq!(model.output_shape(1), vec![1, 40]);

    let images = random_images(1, [3, 80, 320, 3], 11);
    let predictions = model.predict(&images).unwrap();
    assert_eq!(predictions.shape(), &[1, 40]);
    assert_rows_sum_to(&predictions, 3.0);
}

#[test]
fn test_output_is_sum_of_three_distributions() {
    let mut model = tiny_model();
    let images = random_images(2, [3, 10, 14, 3], 1);
    let predictions = model.predict(&images).unwrap();
    assert_eq!(predictions.shape(), &[2, CLASSES]);
    assert_rows_sum_to(&predictions, 3.0);
    assert!(predictions.data().iter().all(|&p| (0.0..=3.0).contains(&p)));
}

#[test]
fn test_predict_is_deterministic_and_stateless() {
    let mut model = tiny_model();
    let images = random_images(2, [3, 10, 14, 3], 2);
    let state = model.state_dict();
    let first = model.predict(&images).unwrap();
    let second = model.predict(&images).unwrap();
    assert_eq!(first, second);
    assert_eq!(model.state_dict(), state);
}

#[test]
fn test_rejects_wrong_input_shape() {
    let mut model = tiny_model();
    let images = random_images(1, [3, 10, 12, 3], 3);
    assert!(matches!(model.predict(&images), Err(ModelError::Shape { .. })));
}

#[test]
fn test_rejects_empty_batch() {
    let mut model = tiny_model();
    let before = model.state_dict();
    let images = Tensor::zeros(&[0, 3, 10, 14, 3]);
    let targets = to_categorical(&[], CLASSES).unwrap();

    assert!(matches!(model.predict(&images), Err(ModelError::Shape { .. })));
    assert!(matches!(model.train_step(&images, &targets), Err(ModelError::Shape { .. })));
    assert_eq!(model.state_dict(), before);
}

#[test]
fn test_same_seed_builds_same_weights() {
    assert_eq!(tiny_model().state_dict(), tiny_model().state_dict());
    let other = XceptionModel::build(
        &ArchitectureConfig::shallow(),
        ModelOptions {
            seed: 7,
            ..tiny_options()
        },
        &CpuBackend::new(),
    )
    .unwrap();
    assert_ne!(other.state_dict(), tiny_model().state_dict());
}

// ============================================================================
// Weight Sharing
// ============================================================================

#[test]
fn test_extractor_is_shared_and_heads_are_separate() {
    let model = tiny_model();
    assert_eq!(model.heads().len(), 3);
    let head_params: usize = model.heads().iter().map(|h| h.parameter_count()).sum();
    assert_eq!(model.parameter_count(), model.extractor().parameter_count() + head_params);
    assert_eq!(head_params, 3 * (CLASSES * CLASSES + CLASSES));

    let state = model.state_dict();
    let extractor_keys = model.extractor().state().len();
    let head_keys: usize = model.heads().iter().map(|h| h.state().len()).sum();
    assert_eq!(state.len(), extractor_keys + head_keys);
    for slice in 0..3 {
        assert!(state.contains_key(&format!("predictions{}/kernel", slice)));
        assert!(state.contains_key(&format!("predictions{}/bias", slice)));
    }
    assert!(state.contains_key("block1_conv1/kernel"));
    assert!(state.contains_key("predictions_/kernel"));
}

#[test]
fn test_train_step_updates_every_head_and_the_extractor() {
    let mut model = tiny_model();
    let before = model.state_dict();
    let images = random_images(2, [3, 10, 14, 3], 4);
    let targets = to_categorical(&[1, 3], CLASSES).unwrap();

    let metrics = model.train_step(&images, &targets).unwrap();
    assert!(metrics.loss.is_finite());
    assert!(metrics.accuracy.is_some());

    let after = model.state_dict();
    for key in [
        "predictions0/kernel",
        "predictions1/kernel",
        "predictions2/kernel",
        "predictions_/kernel",
        "block1_conv1/kernel",
        "block2_sepconv23/pointwise_kernel",
        "block1_conv1_bn/moving_mean",
    ] {
        assert_ne!(before[key], after[key], "{} was not updated", key);
    }

    // Each head sees a different slice, so each receives its own gradient
    let deltas: Vec<Vec<f32>> = (0..3)
        .map(|slice| {
            let key = format!("predictions{}/kernel", slice);
            before[&key].iter().zip(&after[&key]).map(|(b, a)| a - b).collect()
        })
        .collect();
    assert_ne!(deltas[0], deltas[1]);
    assert_ne!(deltas[0], deltas[2]);
    assert_ne!(deltas[1], deltas[2]);
}

// ============================================================================
// Training and Evaluation
// ============================================================================

#[test]
fn test_training_reduces_loss_on_fixed_batch() {
    let mut model = tiny_model();
    model
        .compile(CompileOptions {
            optimizer: OptimizerConfig {
                learning_rate: Some(0.05),
                ..OptimizerConfig::named("sgd")
            },
            ..CompileOptions::default()
        })
        .unwrap();
    let images = random_images(4, [3, 10, 14, 3], 5);
    let targets = to_categorical(&[0, 1, 2, 3], CLASSES).unwrap();

    let first = model.train_step(&images, &targets).unwrap().loss;
    let mut last = first;
    for _ in 0..20 {
        last = model.train_step(&images, &targets).unwrap().loss;
    }
    assert!(last < first, "loss went from {} to {}", first, last);
}

#[test]
fn test_evaluate_does_not_change_parameters() {
    let mut model = tiny_model();
    let images = random_images(2, [3, 10, 14, 3], 6);
    let targets = to_categorical(&[0, 2], CLASSES).unwrap();
    let before = model.state_dict();
    let metrics = model.evaluate(&images, &targets).unwrap();
    assert!(metrics.loss > 0.0);
    let accuracy = metrics.accuracy.unwrap();
    assert!((0.0..=1.0).contains(&accuracy));
    assert_eq!(model.state_dict(), before);
}

#[test]
fn test_train_step_rejects_mismatched_targets() {
    let mut model = tiny_model();
    let images = random_images(2, [3, 10, 14, 3], 7);
    let targets = to_categorical(&[0], CLASSES).unwrap();
    assert!(model.train_step(&images, &targets).is_err());
}

#[test]
fn test_residual_architecture_trains() {
    let arch = ArchitectureConfig {
        stages: vec![
            StageConfig::conv("stem", 4, 1, true),
            StageConfig::entry_block("entry", &[8, 8], false),
            StageConfig::middle_block("middle", &[8, 8]),
        ],
        ..ArchitectureConfig::shallow()
    };
    let options = ModelOptions {
        input_shape: Some([3, 8, 8, 3]),
        ..tiny_options()
    };
    let mut model = XceptionModel::build(&arch, options, &CpuBackend::new()).unwrap();
    let images = random_images(2, [3, 8, 8, 3], 8);
    let targets = to_categorical(&[2, 1], CLASSES).unwrap();
    let metrics = model.train_step(&images, &targets).unwrap();
    assert!(metrics.loss.is_finite());
    assert_rows_sum_to(&model.predict(&images).unwrap(), 3.0);
}

// ============================================================================
// Checkpoints
// ============================================================================

#[test]
fn test_checkpoint_round_trip_restores_predictions() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("model_checkpoint1.h5");

    let mut model = tiny_model();
    let images = random_images(2, [3, 10, 14, 3], 9);
    let targets = to_categorical(&[3, 0], CLASSES).unwrap();
    model.train_step(&images, &targets).unwrap();
    let expected = model.predict(&images).unwrap();
    model.save(&path).unwrap();

    let mut loaded = XceptionModel::load(&path, &CpuBackend::new()).unwrap();
    assert_eq!(loaded.state_dict(), model.state_dict());
    assert_eq!(loaded.predict(&images).unwrap(), expected);

    let options = ModelOptions {
        weights: Weights::Checkpoint(path.clone()),
        seed: 99,
        ..tiny_options()
    };
    let mut resumed = XceptionModel::build(&ArchitectureConfig::shallow(), options, &CpuBackend::new()).unwrap();
    assert_eq!(resumed.predict(&images).unwrap(), expected);
}

#[test]
fn test_checkpoint_for_other_topology_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("other.h5");
    let other = XceptionModel::build(
        &ArchitectureConfig::shallow(),
        ModelOptions {
            num_classes: 5,
            ..tiny_options()
        },
        &CpuBackend::new(),
    )
    .unwrap();
    other.save(&path).unwrap();

    let options = ModelOptions {
        weights: Weights::Checkpoint(path),
        ..tiny_options()
    };
    let result = XceptionModel::build(&ArchitectureConfig::shallow(), options, &CpuBackend::new());
    assert!(matches!(result, Err(ModelError::Checkpoint(_))));
}

#[test]
fn test_load_state_dict_rejects_unknown_buffers() {
    let mut model = tiny_model();
    let mut state = model.state_dict();
    state.insert("block9_conv1/kernel".to_string(), vec![0.0]);
    assert!(matches!(model.load_state_dict(&state), Err(ModelError::Checkpoint(_))));

    let mut state = model.state_dict();
    state.remove("predictions1/bias");
    assert!(matches!(model.load_state_dict(&state), Err(ModelError::Checkpoint(_))));
}

// ============================================================================
// Backends
// ============================================================================

#[test]
fn test_channels_first_backend_is_overridden() {
    let backend = CpuBackend::with_data_format(DataFormat::ChannelsFirst);
    let model = XceptionModel::build(&ArchitectureConfig::shallow(), tiny_options(), &backend).unwrap();
    assert!(model.layout_overridden());
    assert!(!tiny_model().layout_overridden());
}

#[test]
fn test_backend_without_required_primitive_is_rejected() {
    let result = XceptionModel::build(&ArchitectureConfig::shallow(), tiny_options(), &NoSeparableBackend);
    assert!(matches!(result, Err(ModelError::Backend(_))));
}
