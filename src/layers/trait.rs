//! Layer trait definition for neural network layers
//!
//! This module defines the core Layer trait that all layer types implement.
//! The trait provides a common interface for forward propagation, backward
//! propagation, parameter updates and state persistence.

use crate::error::{ModelError, Result};
use crate::layers::FeatureShape;
use crate::optimizers::Optimizer;
use std::cell::RefCell;
use std::collections::BTreeMap;

/// Named parameter buffers of a layer, as written to a checkpoint.
pub type LayerState = Vec<(String, Vec<f32>)>;

/// Core trait for neural network layers.
///
/// Data is passed as flat channels-last `f32` buffers of
/// `batch_size × input_shape().len()` elements.
///
/// Layers hold no per-call caches: `backward` recomputes whatever it needs
/// from the `input` it is given. This is what allows a single layer (and a
/// graph of layers) to be applied several times within one training step,
/// each application being back-propagated with its own input, while the
/// parameter gradients of all applications accumulate in the same buffers.
///
/// # Example
///
/// ```ignore
/// let mut output = vec![0.0f32; batch_size * layer.output_size()];
/// layer.forward(&input, &mut output, batch_size);
///
/// let mut grad_input = vec![0.0f32; batch_size * layer.input_size()];
/// layer.backward(&input, &grad_output, &mut grad_input, batch_size);
/// layer.update_with_optimizer(&mut optimizer);
/// ```
pub trait Layer {
    /// Unique name within a model; prefixes the layer's checkpoint keys.
    fn name(&self) -> &str;

    /// Forward propagation through the layer.
    fn forward(&self, input: &[f32], output: &mut [f32], batch_size: usize);

    /// Backward propagation through the layer.
    ///
    /// Overwrites `grad_input` with the gradient w.r.t. the layer input and
    /// adds the parameter gradients to the layer's internal accumulators.
    fn backward(
        &self,
        input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    );

    /// Applies the accumulated gradients through `optimizer` and clears them.
    fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer);

    /// Switches between training and inference behaviour. Only layers whose
    /// behaviour differs (batch normalization) override this.
    fn set_training(&mut self, _training: bool) {}

    fn input_shape(&self) -> FeatureShape;

    fn output_shape(&self) -> FeatureShape;

    /// Number of input values per sample.
    fn input_size(&self) -> usize {
        self.input_shape().len()
    }

    /// Number of output values per sample.
    fn output_size(&self) -> usize {
        self.output_shape().len()
    }

    /// Number of trainable parameters.
    fn parameter_count(&self) -> usize;

    /// All persistent buffers (trainable and non-trainable), keyed
    /// `"<layer name>/<buffer>"`.
    fn state(&self) -> LayerState;

    /// Restores the buffers written by [`Layer::state`].
    fn load_state(&mut self, state: &BTreeMap<String, Vec<f32>>) -> Result<()>;
}

/// Checkpoint/optimizer key of a layer buffer.
pub(crate) fn param_key(layer: &str, buffer: &str) -> String {
    format!("{}/{}", layer, buffer)
}

/// Copies `state[key]` into `target`, checking presence and length.
pub(crate) fn load_buffer(
    state: &BTreeMap<String, Vec<f32>>,
    key: &str,
    target: &mut [f32],
) -> Result<()> {
    let values = state
        .get(key)
        .ok_or_else(|| ModelError::Checkpoint(format!("missing buffer '{}'", key)))?;
    if values.len() != target.len() {
        return Err(ModelError::Checkpoint(format!(
            "buffer '{}' has {} values, expected {}",
            key,
            values.len(),
            target.len()
        )));
    }
    target.copy_from_slice(values);
    Ok(())
}

/// Runs one optimizer update for a parameter buffer and zeroes its gradient.
pub(crate) fn apply_gradients(
    optimizer: &mut dyn Optimizer,
    key: &str,
    parameters: &mut [f32],
    gradients: &RefCell<Vec<f32>>,
) {
    let mut grads = gradients.borrow_mut();
    optimizer.update(key, parameters, &grads);
    grads.iter_mut().for_each(|g| *g = 0.0);
}
