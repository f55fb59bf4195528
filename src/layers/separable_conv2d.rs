//! Depthwise-separable 2D convolution.
//!
//! A per-channel `k×k` depthwise convolution (depth multiplier 1) followed by
//! a `1×1` pointwise convolution mixing channels, as in Xception.

use crate::error::{config_error, Result};
use crate::layers::r#trait::{apply_gradients, load_buffer, param_key, LayerState};
use crate::layers::shape::Window;
use crate::layers::{FeatureShape, Layer, Padding};
use crate::optimizers::Optimizer;
use crate::utils::rng::{glorot_limit, SimpleRng};
use std::cell::RefCell;
use std::collections::BTreeMap;

/// Depthwise-separable convolution without bias.
///
/// Depthwise kernel layout is `[kernel_y][kernel_x][channels]`, pointwise
/// kernel layout is `[channels][filters]`.
pub struct SeparableConv2DLayer {
    name: String,
    channels: usize,
    filters: usize,
    window: Window,
    depthwise: Vec<f32>,
    pointwise: Vec<f32>,
    grad_depthwise: RefCell<Vec<f32>>,
    grad_pointwise: RefCell<Vec<f32>>,
}

impl SeparableConv2DLayer {
    /// Glorot-uniform initialised separable convolution.
    ///
    /// Fans follow Keras: the depthwise kernel uses `fan_in = fan_out = k²`,
    /// the pointwise kernel `fan_in = channels`, `fan_out = filters`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        input: FeatureShape,
        filters: usize,
        kernel_size: usize,
        stride: usize,
        padding: Padding,
        rng: &mut SimpleRng,
    ) -> Result<Self> {
        let (in_h, in_w, channels) = match input {
            FeatureShape::Map {
                height,
                width,
                channels,
            } => (height, width, channels),
            FeatureShape::Vector(_) => {
                return Err(config_error(format!(
                    "{}: separable convolution needs a feature map input",
                    name
                )))
            }
        };
        if filters == 0 || channels == 0 {
            return Err(config_error(format!("{}: channel counts must be positive", name)));
        }
        let window = Window::new(in_h, in_w, kernel_size, stride, padding).ok_or_else(|| {
            config_error(format!(
                "{}: kernel {}x{} stride {} does not fit a {}x{} input",
                name, kernel_size, kernel_size, stride, in_h, in_w
            ))
        })?;

        let taps = kernel_size * kernel_size;
        let mut depthwise = vec![0.0f32; taps * channels];
        rng.fill_uniform(&mut depthwise, glorot_limit(taps, taps));

        let mut pointwise = vec![0.0f32; channels * filters];
        rng.fill_uniform(&mut pointwise, glorot_limit(channels, filters));

        Ok(Self {
            name: name.to_string(),
            channels,
            filters,
            window,
            grad_depthwise: RefCell::new(vec![0.0; depthwise.len()]),
            grad_pointwise: RefCell::new(vec![0.0; pointwise.len()]),
            depthwise,
            pointwise,
        })
    }

    pub fn filters(&self) -> usize {
        self.filters
    }

    pub fn depthwise_kernel(&self) -> &[f32] {
        &self.depthwise
    }

    pub fn pointwise_kernel(&self) -> &[f32] {
        &self.pointwise
    }

    /// Spatial positions of the output map.
    fn out_positions(&self) -> usize {
        self.window.out_h * self.window.out_w
    }

    /// Depthwise stage only: writes `batch × out_positions × channels` values.
    fn depthwise_forward(&self, input: &[f32], mid: &mut [f32], batch_size: usize) {
        let w = &self.window;
        let c = self.channels;
        let in_len = w.in_h * w.in_w * c;
        let mid_len = self.out_positions() * c;

        for b in 0..batch_size {
            let in_b = &input[b * in_len..(b + 1) * in_len];
            for oy in 0..w.out_h {
                for ox in 0..w.out_w {
                    let base = b * mid_len + (oy * w.out_w + ox) * c;
                    let px = &mut mid[base..base + c];
                    px.iter_mut().for_each(|v| *v = 0.0);
                    for ky in 0..w.kernel {
                        for kx in 0..w.kernel {
                            let Some((iy, ix)) = w.tap(oy, ox, ky, kx) else {
                                continue;
                            };
                            let in_base = (iy * w.in_w + ix) * c;
                            let k_base = (ky * w.kernel + kx) * c;
                            for ch in 0..c {
                                px[ch] += in_b[in_base + ch] * self.depthwise[k_base + ch];
                            }
                        }
                    }
                }
            }
        }
    }
}

impl Layer for SeparableConv2DLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let c = self.channels;
        let f = self.filters;
        let positions = batch_size * self.out_positions();
        assert_eq!(input.len(), batch_size * self.input_size(), "{}: input len mismatch", self.name);
        assert_eq!(output.len(), positions * f, "{}: output len mismatch", self.name);

        let mut mid = vec![0.0f32; positions * c];
        self.depthwise_forward(input, &mut mid, batch_size);

        for p in 0..positions {
            let m = &mid[p * c..(p + 1) * c];
            let out = &mut output[p * f..(p + 1) * f];
            out.iter_mut().for_each(|v| *v = 0.0);
            for (ch, &mv) in m.iter().enumerate() {
                let row = &self.pointwise[ch * f..(ch + 1) * f];
                for (o, &wv) in out.iter_mut().zip(row) {
                    *o += mv * wv;
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
        let c = self.channels;
        let f = self.filters;
        let positions_per_sample = self.out_positions();
        let positions = batch_size * positions_per_sample;
        let in_len = w.in_h * w.in_w * c;
        assert_eq!(grad_output.len(), positions * f, "{}: grad_output len mismatch", self.name);
        assert_eq!(grad_input.len(), batch_size * in_len, "{}: grad_input len mismatch", self.name);

        let mut mid = vec![0.0f32; positions * c];
        self.depthwise_forward(input, &mut mid, batch_size);

        // Pointwise stage: dW_pw += mid^T g, d_mid = g W_pw^T
        let mut grad_mid = vec![0.0f32; positions * c];
        {
            let mut grad_pw = self.grad_pointwise.borrow_mut();
            for p in 0..positions {
                let g = &grad_output[p * f..(p + 1) * f];
                for ch in 0..c {
                    let mv = mid[p * c + ch];
                    let row = ch * f;
                    let mut acc = 0.0f32;
                    for oc in 0..f {
                        grad_pw[row + oc] += mv * g[oc];
                        acc += g[oc] * self.pointwise[row + oc];
                    }
                    grad_mid[p * c + ch] = acc;
                }
            }
        }

        // Depthwise stage
        let mut grad_dw = self.grad_depthwise.borrow_mut();
        grad_input.iter_mut().for_each(|v| *v = 0.0);
        let mid_len = positions_per_sample * c;
        for b in 0..batch_size {
            let in_b = &input[b * in_len..(b + 1) * in_len];
            let grad_in_b = &mut grad_input[b * in_len..(b + 1) * in_len];
            for oy in 0..w.out_h {
                for ox in 0..w.out_w {
                    let base = b * mid_len + (oy * w.out_w + ox) * c;
                    let g = &grad_mid[base..base + c];
                    for ky in 0..w.kernel {
                        for kx in 0..w.kernel {
                            let Some((iy, ix)) = w.tap(oy, ox, ky, kx) else {
                                continue;
                            };
                            let in_base = (iy * w.in_w + ix) * c;
                            let k_base = (ky * w.kernel + kx) * c;
                            for ch in 0..c {
                                grad_dw[k_base + ch] += in_b[in_base + ch] * g[ch];
                                grad_in_b[in_base + ch] += g[ch] * self.depthwise[k_base + ch];
                            }
                        }
                    }
                }
            }
        }
    }

    fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer) {
        let key = param_key(&self.name, "depthwise_kernel");
        apply_gradients(optimizer, &key, &mut self.depthwise, &self.grad_depthwise);
        let key = param_key(&self.name, "pointwise_kernel");
        apply_gradients(optimizer, &key, &mut self.pointwise, &self.grad_pointwise);
    }

    fn input_shape(&self) -> FeatureShape {
        FeatureShape::map(self.window.in_h, self.window.in_w, self.channels)
    }

    fn output_shape(&self) -> FeatureShape {
        FeatureShape::map(self.window.out_h, self.window.out_w, self.filters)
    }

    fn parameter_count(&self) -> usize {
        self.depthwise.len() + self.pointwise.len()
    }

    fn state(&self) -> LayerState {
        vec![
            (param_key(&self.name, "depthwise_kernel"), self.depthwise.clone()),
            (param_key(&self.name, "pointwise_kernel"), self.pointwise.clone()),
        ]
    }

    fn load_state(&mut self, state: &BTreeMap<String, Vec<f32>>) -> Result<()> {
        load_buffer(state, &param_key(&self.name, "depthwise_kernel"), &mut self.depthwise)?;
        load_buffer(state, &param_key(&self.name, "pointwise_kernel"), &mut self.pointwise)
    }
}
