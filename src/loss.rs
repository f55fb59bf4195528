//! Loss functions, metrics and label encoding
//!
//! Categorical cross-entropy follows the Keras convention: predictions are
//! first divided by their row sum, so a row holding the sum of several
//! softmax outputs is treated as the distribution it is proportional to.

use crate::error::{config_error, ModelError, Result};
use serde::{Deserialize, Serialize};

/// Probabilities are clipped to `[EPSILON, 1 - EPSILON]` before the log.
pub const EPSILON: f32 = 1e-7;

/// One-hot encodes `labels` over `num_classes` classes, row-major.
///
/// # Errors
///
/// Returns [`ModelError::Label`] for any label `>= num_classes`.
///
/// # Examples
///
/// ```
/// use multislice_xception::loss::to_categorical;
///
/// let one_hot = to_categorical(&[5], 40).unwrap();
/// assert_eq!(one_hot.len(), 40);
/// assert_eq!(one_hot[5], 1.0);
/// assert_eq!(one_hot.iter().sum::<f32>(), 1.0);
/// ```
pub fn to_categorical(labels: &[usize], num_classes: usize) -> Result<Vec<f32>> {
    let mut encoded = vec![0.0f32; labels.len() * num_classes];
    for (row, &label) in labels.iter().enumerate() {
        if label >= num_classes {
            return Err(ModelError::Label { label, num_classes });
        }
        encoded[row * num_classes + label] = 1.0;
    }
    Ok(encoded)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Loss {
    #[default]
    CategoricalCrossentropy,
}

impl Loss {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "categorical_crossentropy" => Ok(Loss::CategoricalCrossentropy),
            other => Err(config_error(format!(
                "Invalid loss '{}'. Must be one of: categorical_crossentropy",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Loss::CategoricalCrossentropy => "categorical_crossentropy",
        }
    }

    /// Mean loss over the batch and its gradient w.r.t. `predictions`.
    pub fn compute(&self, predictions: &[f32], targets: &[f32], num_classes: usize) -> Result<(f32, Vec<f32>)> {
        match self {
            Loss::CategoricalCrossentropy => categorical_crossentropy(predictions, targets, num_classes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Accuracy,
}

impl Metric {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "accuracy" | "acc" | "categorical_accuracy" => Ok(Metric::Accuracy),
            other => Err(config_error(format!(
                "Invalid metric '{}'. Must be one of: accuracy",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Accuracy => "accuracy",
        }
    }

    pub fn compute(&self, predictions: &[f32], targets: &[f32], num_classes: usize) -> f32 {
        match self {
            Metric::Accuracy => categorical_accuracy(predictions, targets, num_classes),
        }
    }
}

fn check_lengths(predictions: &[f32], targets: &[f32], num_classes: usize) -> Result<usize> {
    if num_classes == 0 || predictions.len() != targets.len() || predictions.len() % num_classes != 0 {
        return Err(ModelError::Shape {
            expected: vec![targets.len() / num_classes.max(1), num_classes],
            actual: vec![predictions.len()],
        });
    }
    Ok(predictions.len() / num_classes)
}

/// Categorical cross-entropy averaged over the batch.
///
/// For each row, `q = p / Σp` is clipped to `[EPSILON, 1 - EPSILON]` and the
/// loss is `-Σ t·log(q)`. The returned gradient is w.r.t. the unnormalised
/// `p`, already divided by the batch size.
pub fn categorical_crossentropy(
    predictions: &[f32],
    targets: &[f32],
    num_classes: usize,
) -> Result<(f32, Vec<f32>)> {
    let rows = check_lengths(predictions, targets, num_classes)?;
    if rows == 0 {
        return Ok((0.0, Vec::new()));
    }
    let scale = 1.0 / rows as f32;
    let mut total = 0.0f32;
    let mut grad = vec![0.0f32; predictions.len()];

    for ((p, t), g) in predictions
        .chunks_exact(num_classes)
        .zip(targets.chunks_exact(num_classes))
        .zip(grad.chunks_exact_mut(num_classes))
    {
        let sum = p.iter().sum::<f32>().max(f32::MIN_POSITIVE);

        // dL/dq for every class; zero where the clip is active
        let mut dq = vec![0.0f32; num_classes];
        for k in 0..num_classes {
            let q = p[k] / sum;
            let clipped = q.clamp(EPSILON, 1.0 - EPSILON);
            total -= t[k] * clipped.ln();
            if q == clipped {
                dq[k] = -t[k] / clipped;
            }
        }

        // q_j = p_j / S  =>  dL/dp_k = dq_k / S - Σ_j dq_j p_j / S²
        let weighted: f32 = dq.iter().zip(p.iter()).map(|(d, v)| d * v).sum::<f32>() / (sum * sum);
        for k in 0..num_classes {
            g[k] = (dq[k] / sum - weighted) * scale;
        }
    }

    Ok((total * scale, grad))
}

/// Fraction of rows whose arg-max prediction matches the arg-max target.
pub fn categorical_accuracy(predictions: &[f32], targets: &[f32], num_classes: usize) -> f32 {
    let Ok(rows) = check_lengths(predictions, targets, num_classes) else {
        return 0.0;
    };
    if rows == 0 {
        return 0.0;
    }
    let correct = predictions
        .chunks_exact(num_classes)
        .zip(targets.chunks_exact(num_classes))
        .filter(|(p, t)| argmax(p) == argmax(t))
        .count();
    correct as f32 / rows as f32
}

fn argmax(row: &[f32]) -> usize {
    let mut best = 0;
    for (i, &value) in row.iter().enumerate() {
        if value > row[best] {
            best = i;
        }
    }
    best
}
