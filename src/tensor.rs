//! Dense row-major tensor used at the model boundary.
//!
//! Layers work on flat `f32` slices plus an explicit batch size; `Tensor`
//! carries the shape alongside the data where the model accepts or returns
//! whole batches.

use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};

/// Row-major `f32` tensor. The first axis is always the batch axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Zero-filled tensor of the given shape.
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; shape.iter().product()],
        }
    }

    /// Wraps `data` with `shape`, checking the element count.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ModelError::Shape {
                expected: shape.to_vec(),
                actual: vec![data.len()],
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Size of the leading (batch) axis; zero for a rank-0 tensor.
    pub fn batch_size(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Number of elements per batch entry.
    pub fn sample_size(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Selects index `idx` along axis 1, dropping that axis.
    ///
    /// For a `(batch, slices, h, w, c)` input this yields the `(batch, h, w, c)`
    /// view of one slice, copied into a new tensor.
    pub fn slice_axis1(&self, idx: usize) -> Result<Tensor> {
        if self.shape.len() < 2 || idx >= self.shape[1] {
            return Err(ModelError::Shape {
                expected: vec![self.batch_size(), idx + 1],
                actual: self.shape.clone(),
            });
        }
        let batch = self.shape[0];
        let slices = self.shape[1];
        let inner: usize = self.shape.iter().skip(2).product();

        let mut data = Vec::with_capacity(batch * inner);
        for b in 0..batch {
            let start = (b * slices + idx) * inner;
            data.extend_from_slice(&self.data[start..start + inner]);
        }

        let mut shape = Vec::with_capacity(self.shape.len() - 1);
        shape.push(batch);
        shape.extend_from_slice(&self.shape[2..]);
        Ok(Tensor { shape, data })
    }

    /// Elementwise `self += other`; shapes must match exactly.
    pub fn add_assign(&mut self, other: &Tensor) -> Result<()> {
        if self.shape != other.shape {
            return Err(ModelError::Shape {
                expected: self.shape.clone(),
                actual: other.shape.clone(),
            });
        }
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += *b;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_length() {
        assert!(Tensor::from_vec(&[2, 3], vec![0.0; 6]).is_ok());
        assert!(Tensor::from_vec(&[2, 3], vec![0.0; 5]).is_err());
    }

    #[test]
    fn test_slice_axis1_selects_view() {
        // (batch=2, slices=3, inner=2)
        let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let t = Tensor::from_vec(&[2, 3, 2], data).unwrap();

        let s1 = t.slice_axis1(1).unwrap();
        assert_eq!(s1.shape(), &[2, 2]);
        assert_eq!(s1.data(), &[2.0, 3.0, 8.0, 9.0]);

        assert!(t.slice_axis1(3).is_err());
    }

    #[test]
    fn test_add_assign() {
        let mut a = Tensor::from_vec(&[2, 2], vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let b = Tensor::from_vec(&[2, 2], vec![0.0, 2.0, 0.5, 0.0]).unwrap();
        a.add_assign(&b).unwrap();
        assert_eq!(a.data(), &[1.0, 2.0, 0.5, 1.0]);

        let c = Tensor::zeros(&[1, 2]);
        assert!(a.add_assign(&c).is_err());
    }
}
