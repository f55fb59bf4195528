//! Pooling layers: global average/max pooling and strided max pooling.

use crate::error::{config_error, Result};
use crate::layers::r#trait::LayerState;
use crate::layers::shape::Window;
use crate::layers::{FeatureShape, Layer, Padding};
use crate::optimizers::Optimizer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reduction applied over a pooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    Avg,
    Max,
}

/// Reduces an `(h, w, c)` map to a length-`c` vector.
pub struct GlobalPooling2DLayer {
    name: String,
    input: FeatureShape,
    mode: PoolMode,
}

impl GlobalPooling2DLayer {
    pub fn new(name: &str, input: FeatureShape, mode: PoolMode) -> Result<Self> {
        if !matches!(input, FeatureShape::Map { .. }) {
            return Err(config_error(format!("{}: global pooling needs a feature map", name)));
        }
        Ok(Self {
            name: name.to_string(),
            input,
            mode,
        })
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    /// Spatial index holding the maximum of channel `ch` in one sample.
    fn argmax(&self, sample: &[f32], ch: usize) -> usize {
        let c = self.input.channels();
        let mut best = 0;
        for p in 1..self.input.spatial() {
            if sample[p * c + ch] > sample[best * c + ch] {
                best = p;
            }
        }
        best
    }
}

impl Layer for GlobalPooling2DLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let c = self.input.channels();
        let in_len = self.input.len();
        assert_eq!(input.len(), batch_size * in_len, "{}: input len mismatch", self.name);
        assert_eq!(output.len(), batch_size * c, "{}: output len mismatch", self.name);

        for b in 0..batch_size {
            let sample = &input[b * in_len..(b + 1) * in_len];
            let out = &mut output[b * c..(b + 1) * c];
            match self.mode {
                PoolMode::Avg => {
                    out.iter_mut().for_each(|v| *v = 0.0);
                    for px in sample.chunks_exact(c) {
                        for (o, &x) in out.iter_mut().zip(px) {
                            *o += x;
                        }
                    }
                    let inv = 1.0 / self.input.spatial() as f32;
                    out.iter_mut().for_each(|v| *v *= inv);
                }
                PoolMode::Max => {
                    for (ch, o) in out.iter_mut().enumerate() {
                        *o = sample[self.argmax(sample, ch) * c + ch];
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
        let c = self.input.channels();
        let in_len = self.input.len();
        assert_eq!(grad_input.len(), batch_size * in_len, "{}: grad_input len mismatch", self.name);

        for b in 0..batch_size {
            let g = &grad_output[b * c..(b + 1) * c];
            let grad_in_b = &mut grad_input[b * in_len..(b + 1) * in_len];
            match self.mode {
                PoolMode::Avg => {
                    let inv = 1.0 / self.input.spatial() as f32;
                    for px in grad_in_b.chunks_exact_mut(c) {
                        for (gi, &gv) in px.iter_mut().zip(g) {
                            *gi = gv * inv;
                        }
                    }
                }
                PoolMode::Max => {
                    grad_in_b.iter_mut().for_each(|v| *v = 0.0);
                    let sample = &input[b * in_len..(b + 1) * in_len];
                    for (ch, &gv) in g.iter().enumerate() {
                        grad_in_b[self.argmax(sample, ch) * c + ch] = gv;
                    }
                }
            }
        }
    }

    fn update_with_optimizer(&mut self, _optimizer: &mut dyn Optimizer) {}

    fn input_shape(&self) -> FeatureShape {
        self.input
    }

    fn output_shape(&self) -> FeatureShape {
        FeatureShape::Vector(self.input.channels())
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

/// Strided max pooling over square windows; padded positions never win.
pub struct MaxPooling2DLayer {
    name: String,
    channels: usize,
    window: Window,
}

impl MaxPooling2DLayer {
    pub fn new(
        name: &str,
        input: FeatureShape,
        pool_size: usize,
        stride: usize,
        padding: Padding,
    ) -> Result<Self> {
        let FeatureShape::Map {
            height,
            width,
            channels,
        } = input
        else {
            return Err(config_error(format!("{}: max pooling needs a feature map", name)));
        };
        let window = Window::new(height, width, pool_size, stride, padding).ok_or_else(|| {
            config_error(format!(
                "{}: pool {}x{} stride {} does not fit a {}x{} input",
                name, pool_size, pool_size, stride, height, width
            ))
        })?;
        Ok(Self {
            name: name.to_string(),
            channels,
            window,
        })
    }

    /// Index (within one sample) of the winning input for output `(oy, ox, ch)`.
    fn winner(&self, sample: &[f32], oy: usize, ox: usize, ch: usize) -> usize {
        let w = &self.window;
        let mut best: Option<usize> = None;
        for ky in 0..w.kernel {
            for kx in 0..w.kernel {
                if let Some((iy, ix)) = w.tap(oy, ox, ky, kx) {
                    let idx = (iy * w.in_w + ix) * self.channels + ch;
                    if best.map_or(true, |b| sample[idx] > sample[b]) {
                        best = Some(idx);
                    }
                }
            }
        }
        // A window always covers at least one real input under valid/same padding
        best.unwrap_or(ch)
    }
}

impl Layer for MaxPooling2DLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let in_len = self.input_size();
        let out_len = self.output_size();
        assert_eq!(input.len(), batch_size * in_len, "{}: input len mismatch", self.name);
        let w = &self.window;

        for b in 0..batch_size {
            let sample = &input[b * in_len..(b + 1) * in_len];
            for oy in 0..w.out_h {
                for ox in 0..w.out_w {
                    for ch in 0..self.channels {
                        let out_idx = b * out_len + (oy * w.out_w + ox) * self.channels + ch;
                        output[out_idx] = sample[self.winner(sample, oy, ox, ch)];
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
        let in_len = self.input_size();
        let out_len = self.output_size();
        let w = &self.window;
        grad_input.iter_mut().for_each(|v| *v = 0.0);

        for b in 0..batch_size {
            let sample = &input[b * in_len..(b + 1) * in_len];
            for oy in 0..w.out_h {
                for ox in 0..w.out_w {
                    for ch in 0..self.channels {
                        let g = grad_output[b * out_len + (oy * w.out_w + ox) * self.channels + ch];
                        grad_input[b * in_len + self.winner(sample, oy, ox, ch)] += g;
                    }
                }
            }
        }
    }

    fn update_with_optimizer(&mut self, _optimizer: &mut dyn Optimizer) {}

    fn input_shape(&self) -> FeatureShape {
        FeatureShape::map(self.window.in_h, self.window.in_w, self.channels)
    }

    fn output_shape(&self) -> FeatureShape {
        FeatureShape::map(self.window.out_h, self.window.out_w, self.channels)
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
