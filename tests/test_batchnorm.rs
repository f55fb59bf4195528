// Integration tests for the batch normalization layer.
// Statistics are per channel over batch and spatial positions, with Keras
// defaults (epsilon 1e-3, moving averages with momentum 0.99).

use approx::assert_abs_diff_eq;
use multislice_xception::layers::batchnorm::{DEFAULT_EPSILON, DEFAULT_MOMENTUM};
use multislice_xception::layers::{BatchNormLayer, FeatureShape, Layer};
use multislice_xception::optimizers::SGD;
use multislice_xception::ModelError;
use std::collections::BTreeMap;

fn keras_layer(shape: FeatureShape) -> BatchNormLayer {
    BatchNormLayer::new("block1_conv1_bn", shape, DEFAULT_EPSILON, DEFAULT_MOMENTUM)
}

// Channel j of pixel p holds (p + 1) * 10 * (j + 1), so each channel has a
// different, large spread.
fn spread_input(pixels: usize, channels: usize) -> Vec<f32> {
    let mut input = Vec::with_capacity(pixels * channels);
    for p in 0..pixels {
        for j in 0..channels {
            input.push((p + 1) as f32 * 10.0 * (j + 1) as f32);
        }
    }
    input
}

fn channel_stats(values: &[f32], channels: usize, channel: usize) -> (f32, f32) {
    let column: Vec<f32> = values.iter().skip(channel).step_by(channels).copied().collect();
    let mean = column.iter().sum::<f32>() / column.len() as f32;
    let var = column.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / column.len() as f32;
    (mean, var)
}

// ============================================================================
// Construction
// ============================================================================

#[test]
fn test_batchnorm_initialization() {
    let layer = keras_layer(FeatureShape::map(4, 5, 8));

    assert_eq!(layer.input_size(), 4 * 5 * 8);
    assert_eq!(layer.output_size(), 4 * 5 * 8);
    assert_eq!(layer.parameter_count(), 16); // 8 gamma + 8 beta
    assert!(layer.is_training());
    assert_eq!(layer.epsilon(), 1e-3);
    assert_eq!(layer.momentum(), 0.99);
    assert!(layer.gamma().iter().all(|&g| g == 1.0));
    assert!(layer.beta().iter().all(|&b| b == 0.0));
    assert!(layer.running_mean().iter().all(|&m| m == 0.0));
    assert!(layer.running_var().iter().all(|&v| v == 1.0));
}

#[test]
#[should_panic(expected = "epsilon must be positive")]
fn test_batchnorm_rejects_zero_epsilon() {
    BatchNormLayer::new("bn", FeatureShape::Vector(4), 0.0, 0.99);
}

// ============================================================================
// Training Mode
// ============================================================================

#[test]
fn test_normalizes_over_batch_and_spatial_positions() {
    let shape = FeatureShape::map(2, 3, 3);
    let layer = keras_layer(shape);
    let batch_size = 4;
    let input = spread_input(batch_size * shape.spatial(), 3);
    let mut output = vec![0.0f32; input.len()];

    layer.forward(&input, &mut output, batch_size);

    for j in 0..3 {
        let (mean, var) = channel_stats(&output, 3, j);
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(var, 1.0, epsilon = 1e-3);
    }
}

#[test]
fn test_moving_statistics_follow_keras_momentum() {
    let shape = FeatureShape::map(1, 2, 2);
    let layer = keras_layer(shape);
    let batch_size = 3;
    let input = spread_input(batch_size * shape.spatial(), 2);
    let mut output = vec![0.0f32; input.len()];

    layer.forward(&input, &mut output, batch_size);

    let running_mean = layer.running_mean();
    let running_var = layer.running_var();
    for j in 0..2 {
        let (mean, var) = channel_stats(&input, 2, j);
        assert_abs_diff_eq!(running_mean[j], 0.01 * mean, epsilon = 1e-3);
        assert_abs_diff_eq!(running_var[j], 0.99 + 0.01 * var, epsilon = 1e-2);
    }
}

// ============================================================================
// Inference Mode
// ============================================================================

#[test]
fn test_fresh_layer_inference_is_near_identity() {
    let mut layer = keras_layer(FeatureShape::Vector(4));
    layer.set_training(false);
    let input = vec![0.5, -1.0, 2.0, 3.0];
    let mut output = vec![0.0f32; 4];

    layer.forward(&input, &mut output, 1);

    let scale = 1.0 / (1.0f32 + 1e-3).sqrt();
    for (y, x) in output.iter().zip(&input) {
        assert_abs_diff_eq!(*y, x * scale, epsilon = 1e-6);
    }
    assert!(layer.running_mean().iter().all(|&m| m == 0.0));
}

#[test]
fn test_mode_switching_changes_output() {
    let mut layer = keras_layer(FeatureShape::Vector(3));
    let input = spread_input(4, 3);
    let mut training = vec![0.0f32; input.len()];
    let mut inference = vec![0.0f32; input.len()];

    layer.forward(&input, &mut training, 4);
    layer.set_training(false);
    assert!(!layer.is_training());
    layer.forward(&input, &mut inference, 4);

    assert!(training.iter().zip(&inference).any(|(a, b)| (a - b).abs() > 1e-3));
}

// ============================================================================
// Parameters and State
// ============================================================================

#[test]
fn test_beta_update_from_accumulated_gradient() {
    let shape = FeatureShape::map(2, 2, 2);
    let mut layer = keras_layer(shape);
    let batch_size = 2;
    let input = spread_input(batch_size * shape.spatial(), 2);
    let grad_output = vec![1.0f32; input.len()];
    let mut grad_input = vec![0.0f32; input.len()];

    layer.backward(&input, &grad_output, &mut grad_input, batch_size);

    // A constant upstream gradient is removed entirely by the mean subtraction
    for g in &grad_input {
        assert_abs_diff_eq!(*g, 0.0, epsilon = 1e-4);
    }

    let mut optimizer = SGD::new(0.5);
    layer.update_with_optimizer(&mut optimizer);
    // dβ = Σ g = 8 per channel
    for &b in layer.beta() {
        assert_abs_diff_eq!(b, -4.0, epsilon = 1e-6);
    }
}

#[test]
fn test_state_round_trip() {
    let shape = FeatureShape::Vector(3);
    let source = keras_layer(shape);
    let input = spread_input(2, 3);
    let mut output = vec![0.0f32; input.len()];
    source.forward(&input, &mut output, 2);

    let state: BTreeMap<String, Vec<f32>> = source.state().into_iter().collect();
    assert!(state.contains_key("block1_conv1_bn/moving_variance"));

    let mut target = keras_layer(shape);
    target.load_state(&state).unwrap();
    assert_eq!(target.running_mean(), source.running_mean());
    assert_eq!(target.running_var(), source.running_var());

    let mut partial = state.clone();
    partial.remove("block1_conv1_bn/gamma");
    assert!(matches!(target.load_state(&partial), Err(ModelError::Checkpoint(_))));
}
