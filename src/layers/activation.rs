//! Parameter-free activation layers.

use crate::error::Result;
use crate::layers::r#trait::LayerState;
use crate::layers::{FeatureShape, Layer};
use crate::optimizers::Optimizer;
use crate::utils::activations::{relu_inplace, softmax_rows};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Activation applied by an [`ActivationLayer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    /// Softmax over the channel (last) axis.
    Softmax,
}

pub struct ActivationLayer {
    name: String,
    shape: FeatureShape,
    activation: Activation,
}

impl ActivationLayer {
    pub fn new(name: &str, shape: FeatureShape, activation: Activation) -> Self {
        Self {
            name: name.to_string(),
            shape,
            activation,
        }
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }
}

impl Layer for ActivationLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &[f32], output: &mut [f32], batch_size: usize) {
        assert_eq!(input.len(), batch_size * self.shape.len(), "{}: input len mismatch", self.name);
        output.copy_from_slice(input);
        match self.activation {
            Activation::Relu => relu_inplace(output),
            Activation::Softmax => {
                let cols = self.shape.channels();
                let rows = output.len() / cols;
                softmax_rows(output, rows, cols);
            }
        }
    }

    fn backward(
        &self,
        input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        assert_eq!(grad_output.len(), batch_size * self.shape.len(), "{}: grad_output len mismatch", self.name);
        match self.activation {
            Activation::Relu => {
                for ((gi, &g), &x) in grad_input.iter_mut().zip(grad_output).zip(input) {
                    *gi = if x > 0.0 { g } else { 0.0 };
                }
            }
            Activation::Softmax => {
                // dx_i = y_i (g_i - Σ_j g_j y_j)
                let cols = self.shape.channels();
                let mut probs = input.to_vec();
                let rows = probs.len() / cols;
                softmax_rows(&mut probs, rows, cols);
                for ((y, g), gi) in probs
                    .chunks_exact(cols)
                    .zip(grad_output.chunks_exact(cols))
                    .zip(grad_input.chunks_exact_mut(cols))
                {
                    let dot: f32 = y.iter().zip(g).map(|(a, b)| a * b).sum();
                    for j in 0..cols {
                        gi[j] = y[j] * (g[j] - dot);
                    }
                }
            }
        }
    }

    fn update_with_optimizer(&mut self, _optimizer: &mut dyn Optimizer) {}

    fn input_shape(&self) -> FeatureShape {
        self.shape
    }

    fn output_shape(&self) -> FeatureShape {
        self.shape
    }

    fn parameter_count(&self) -> usize {
        0
    }

    fn state(&self) -> LayerState {
        Vec::new()
    }

    fn load_state(&mut self, _state: &BTreeMap<String, Vec<f32>>) -> Result<()> {
        Ok(())
    }
}
