//! 2D Convolutional layer implementation
//!
//! This module provides a Conv2DLayer that performs channels-last 2D
//! convolution with configurable stride, Keras-style `valid`/`same` padding
//! and an optional bias.

use crate::error::{config_error, Result};
use crate::layers::r#trait::{apply_gradients, load_buffer, param_key, LayerState};
use crate::layers::shape::Window;
use crate::layers::{FeatureShape, Layer, Padding};
use crate::optimizers::Optimizer;
use crate::utils::rng::{glorot_limit, SimpleRng};
use std::cell::RefCell;
use std::collections::BTreeMap;

/// 2D Convolutional layer with learnable filters.
///
/// Kernel layout is `[kernel_y][kernel_x][in_channels][filters]`, the same
/// order Keras stores `Conv2D` kernels in, so the innermost loop of both
/// passes walks contiguous output channels.
///
/// # Example
///
/// ```ignore
/// use multislice_xception::layers::{Conv2DLayer, FeatureShape, Padding};
/// use multislice_xception::utils::SimpleRng;
///
/// let mut rng = SimpleRng::new(42);
/// let input = FeatureShape::map(80, 320, 3);
/// let layer = Conv2DLayer::new("block1_conv1", input, 32, 3, 2, Padding::Valid, false, &mut rng)?;
/// assert_eq!(layer.output_shape(), FeatureShape::map(39, 159, 32));
/// ```
pub struct Conv2DLayer {
    name: String,
    in_channels: usize,
    filters: usize,
    padding: Padding,
    window: Window,
    use_bias: bool,
    weights: Vec<f32>,
    biases: Vec<f32>,
    // Gradient accumulators (mutable interior via RefCell for trait compatibility)
    grad_weights: RefCell<Vec<f32>>,
    grad_biases: RefCell<Vec<f32>>,
}

impl Conv2DLayer {
    /// Create a new Conv2DLayer with Xavier (Glorot uniform) initialization.
    ///
    /// `limit = sqrt(6 / (fan_in + fan_out))` with
    /// `fan_in = in_channels × kernel²` and `fan_out = filters × kernel²`.
    /// Biases start at zero.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `input` is not a feature map, if any
    /// size is zero, or if the kernel does not fit the input.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        input: FeatureShape,
        filters: usize,
        kernel_size: usize,
        stride: usize,
        padding: Padding,
        use_bias: bool,
        rng: &mut SimpleRng,
    ) -> Result<Self> {
        let (in_h, in_w, in_channels) = match input {
            FeatureShape::Map {
                height,
                width,
                channels,
            } => (height, width, channels),
            FeatureShape::Vector(_) => {
                return Err(config_error(format!(
                    "{}: convolution needs a feature map input",
                    name
                )))
            }
        };
        if filters == 0 || in_channels == 0 {
            return Err(config_error(format!("{}: channel counts must be positive", name)));
        }
        let window = Window::new(in_h, in_w, kernel_size, stride, padding).ok_or_else(|| {
            config_error(format!(
                "{}: kernel {}x{} stride {} does not fit a {}x{} input",
                name, kernel_size, kernel_size, stride, in_h, in_w
            ))
        })?;

        let taps = kernel_size * kernel_size;
        let limit = glorot_limit(in_channels * taps, filters * taps);

        let weight_count = taps * in_channels * filters;
        let mut weights = vec![0.0f32; weight_count];
        rng.fill_uniform(&mut weights, limit);
        let bias_count = if use_bias { filters } else { 0 };

        Ok(Self {
            name: name.to_string(),
            in_channels,
            filters,
            padding,
            window,
            use_bias,
            weights,
            biases: vec![0.0f32; bias_count],
            grad_weights: RefCell::new(vec![0.0f32; weight_count]),
            grad_biases: RefCell::new(vec![0.0f32; bias_count]),
        })
    }

    pub fn filters(&self) -> usize {
        self.filters
    }

    pub fn kernel_size(&self) -> usize {
        self.window.kernel
    }

    pub fn stride(&self) -> usize {
        self.window.stride
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    /// Snapshot of the accumulated kernel gradient.
    pub fn weight_gradients(&self) -> Vec<f32> {
        self.grad_weights.borrow().clone()
    }
}

impl Layer for Conv2DLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let w = &self.window;
        let cin = self.in_channels;
        let cout = self.filters;
        let in_len = w.in_h * w.in_w * cin;
        let out_len = w.out_h * w.out_w * cout;
        assert_eq!(input.len(), batch_size * in_len, "{}: input len mismatch", self.name);
        assert_eq!(output.len(), batch_size * out_len, "{}: output len mismatch", self.name);

        for b in 0..batch_size {
            let in_b = &input[b * in_len..(b + 1) * in_len];
            for oy in 0..w.out_h {
                for ox in 0..w.out_w {
                    let out_base = b * out_len + (oy * w.out_w + ox) * cout;
                    let out_px = &mut output[out_base..out_base + cout];
                    if self.use_bias {
                        out_px.copy_from_slice(&self.biases);
                    } else {
                        out_px.iter_mut().for_each(|v| *v = 0.0);
                    }

                    for ky in 0..w.kernel {
                        for kx in 0..w.kernel {
                            let Some((iy, ix)) = w.tap(oy, ox, ky, kx) else {
                                continue;
                            };
                            let in_base = (iy * w.in_w + ix) * cin;
                            let w_base = (ky * w.kernel + kx) * cin * cout;
                            for ic in 0..cin {
                                let x = in_b[in_base + ic];
                                let w_row = &self.weights[w_base + ic * cout..w_base + (ic + 1) * cout];
                                for (o, &wv) in out_px.iter_mut().zip(w_row) {
                                    *o += x * wv;
                                }
                            }
                        }
                    }
                }
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
        let w = &self.window;
        let cin = self.in_channels;
        let cout = self.filters;
        let in_len = w.in_h * w.in_w * cin;
        let out_len = w.out_h * w.out_w * cout;
        assert_eq!(grad_output.len(), batch_size * out_len, "{}: grad_output len mismatch", self.name);
        assert_eq!(grad_input.len(), batch_size * in_len, "{}: grad_input len mismatch", self.name);

        let mut grad_w = self.grad_weights.borrow_mut();
        let mut grad_b = self.grad_biases.borrow_mut();

        // Zero grad_input first as we accumulate into it
        grad_input.iter_mut().for_each(|v| *v = 0.0);

        for b in 0..batch_size {
            let in_b = &input[b * in_len..(b + 1) * in_len];
            let grad_in_b = &mut grad_input[b * in_len..(b + 1) * in_len];
            for oy in 0..w.out_h {
                for ox in 0..w.out_w {
                    let out_base = b * out_len + (oy * w.out_w + ox) * cout;
                    let g = &grad_output[out_base..out_base + cout];

                    if self.use_bias {
                        for (gb, &gv) in grad_b.iter_mut().zip(g) {
                            *gb += gv;
                        }
                    }

                    for ky in 0..w.kernel {
                        for kx in 0..w.kernel {
                            let Some((iy, ix)) = w.tap(oy, ox, ky, kx) else {
                                continue;
                            };
                            let in_base = (iy * w.in_w + ix) * cin;
                            let w_base = (ky * w.kernel + kx) * cin * cout;
                            for ic in 0..cin {
                                let x = in_b[in_base + ic];
                                let row = w_base + ic * cout;
                                let mut acc = 0.0f32;
                                for oc in 0..cout {
                                    grad_w[row + oc] += x * g[oc];
                                    acc += g[oc] * self.weights[row + oc];
                                }
                                grad_in_b[in_base + ic] += acc;
                            }
                        }
                    }
                }
            }
        }
    }

    fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer) {
        let key = param_key(&self.name, "kernel");
        apply_gradients(optimizer, &key, &mut self.weights, &self.grad_weights);
        if self.use_bias {
            let key = param_key(&self.name, "bias");
            apply_gradients(optimizer, &key, &mut self.biases, &self.grad_biases);
        }
    }

    fn input_shape(&self) -> FeatureShape {
        FeatureShape::map(self.window.in_h, self.window.in_w, self.in_channels)
    }

    fn output_shape(&self) -> FeatureShape {
        FeatureShape::map(self.window.out_h, self.window.out_w, self.filters)
    }

    fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    fn state(&self) -> LayerState {
        let mut state = vec![(param_key(&self.name, "kernel"), self.weights.clone())];
        if self.use_bias {
            state.push((param_key(&self.name, "bias"), self.biases.clone()));
        }
        state
    }

    fn load_state(&mut self, state: &BTreeMap<String, Vec<f32>>) -> Result<()> {
        load_buffer(state, &param_key(&self.name, "kernel"), &mut self.weights)?;
        if self.use_bias {
            load_buffer(state, &param_key(&self.name, "bias"), &mut self.biases)?;
        }
        Ok(())
    }
}
