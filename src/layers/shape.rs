//! Per-sample feature shapes and padding arithmetic.

use serde::{Deserialize, Serialize};

/// Shape of one sample flowing between layers (the batch axis is implicit).
///
/// Feature maps are stored channels-last: `index = (y * width + x) * channels + c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureShape {
    /// Spatial feature map `(height, width, channels)`.
    Map {
        height: usize,
        width: usize,
        channels: usize,
    },
    /// Flat feature vector.
    Vector(usize),
}

impl FeatureShape {
    pub fn map(height: usize, width: usize, channels: usize) -> Self {
        FeatureShape::Map {
            height,
            width,
            channels,
        }
    }

    /// Number of `f32` values per sample.
    pub fn len(&self) -> usize {
        match *self {
            FeatureShape::Map {
                height,
                width,
                channels,
            } => height * width * channels,
            FeatureShape::Vector(n) => n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Channel count of a map, or the length of a vector.
    pub fn channels(&self) -> usize {
        match *self {
            FeatureShape::Map { channels, .. } => channels,
            FeatureShape::Vector(n) => n,
        }
    }

    /// Number of spatial positions (1 for vectors).
    pub fn spatial(&self) -> usize {
        match *self {
            FeatureShape::Map { height, width, .. } => height * width,
            FeatureShape::Vector(_) => 1,
        }
    }

    /// Dimensions without the batch axis.
    pub fn dims(&self) -> Vec<usize> {
        match *self {
            FeatureShape::Map {
                height,
                width,
                channels,
            } => vec![height, width, channels],
            FeatureShape::Vector(n) => vec![n],
        }
    }
}

/// Spatial padding policy, with Keras semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    /// No padding: `out = (in - kernel) / stride + 1`.
    #[default]
    Valid,
    /// Zero padding so that `out = ceil(in / stride)`.
    Same,
}

impl Padding {
    /// Output length along one axis, or `None` if the kernel does not fit.
    pub fn output_len(self, input: usize, kernel: usize, stride: usize) -> Option<usize> {
        if stride == 0 || kernel == 0 {
            return None;
        }
        match self {
            Padding::Valid => {
                if input < kernel {
                    None
                } else {
                    Some((input - kernel) / stride + 1)
                }
            }
            Padding::Same => {
                if input == 0 {
                    None
                } else {
                    Some((input + stride - 1) / stride)
                }
            }
        }
    }

    /// Zero rows/columns inserted before the first input element.
    pub fn pad_before(self, input: usize, kernel: usize, stride: usize) -> usize {
        match self {
            Padding::Valid => 0,
            Padding::Same => {
                let out = (input + stride - 1) / stride;
                let needed = ((out - 1) * stride + kernel).saturating_sub(input);
                needed / 2
            }
        }
    }
}

/// Geometry of a sliding window over a feature map, shared by the
/// convolution and pooling layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Window {
    pub in_h: usize,
    pub in_w: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub kernel: usize,
    pub stride: usize,
    pub pad_top: isize,
    pub pad_left: isize,
}

impl Window {
    pub fn new(
        in_h: usize,
        in_w: usize,
        kernel: usize,
        stride: usize,
        padding: Padding,
    ) -> Option<Self> {
        Some(Self {
            in_h,
            in_w,
            out_h: padding.output_len(in_h, kernel, stride)?,
            out_w: padding.output_len(in_w, kernel, stride)?,
            kernel,
            stride,
            pad_top: padding.pad_before(in_h, kernel, stride) as isize,
            pad_left: padding.pad_before(in_w, kernel, stride) as isize,
        })
    }

    /// Input coordinate hit by kernel tap `(ky, kx)` at output `(oy, ox)`,
    /// or `None` when it falls into the padding.
    #[inline]
    pub fn tap(&self, oy: usize, ox: usize, ky: usize, kx: usize) -> Option<(usize, usize)> {
        let iy = (oy * self.stride + ky) as isize - self.pad_top;
        let ix = (ox * self.stride + kx) as isize - self.pad_left;
        if iy >= 0 && iy < self.in_h as isize && ix >= 0 && ix < self.in_w as isize {
            Some((iy as usize, ix as usize))
        } else {
            None
        }
    }
}
