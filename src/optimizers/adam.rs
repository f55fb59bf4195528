//! Adam (Adaptive Moment Estimation) optimizer implementation
//!
//! Moment estimates and the bias-correction step counter are tracked per
//! parameter key, so every buffer of a model gets its own trajectory.

use crate::optimizers::Optimizer;
use std::collections::HashMap;

/// Per-key Adam state.
#[derive(Debug, Clone)]
struct Moments {
    /// First moment estimates
    m: Vec<f32>,
    /// Second moment estimates
    v: Vec<f32>,
    /// Time step counter for bias correction
    t: i32,
}

/// Adam (Adaptive Moment Estimation) optimizer.
///
/// ```text
/// m_t = β1 * m_{t-1} + (1 - β1) * gradient
/// v_t = β2 * v_{t-1} + (1 - β2) * gradient²
/// m_hat = m_t / (1 - β1^t)
/// v_hat = v_t / (1 - β2^t)
/// parameter = parameter - α * m_hat / (√v_hat + ε)
/// ```
///
/// # Reference
///
/// Kingma, D. P., & Ba, J. (2014). Adam: A method for stochastic optimization.
/// arXiv preprint arXiv:1412.6980.
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    moments: HashMap<String, Moments>,
}

impl Adam {
    /// Creates a new Adam optimizer with the specified hyperparameters.
    ///
    /// # Examples
    ///
    /// ```
    /// use multislice_xception::optimizers::adam::Adam;
    /// use multislice_xception::optimizers::Optimizer;
    ///
    /// let optimizer = Adam::new(0.001, 0.9, 0.999, 1e-7);
    /// assert_eq!(optimizer.learning_rate(), 0.001);
    /// ```
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            moments: HashMap::new(),
        }
    }

    /// Number of update steps taken for `key` so far.
    pub fn step(&self, key: &str) -> usize {
        self.moments.get(key).map_or(0, |state| state.t as usize)
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &'static str {
        "adam"
    }

    fn update(&mut self, key: &str, parameters: &mut [f32], gradients: &[f32]) {
        assert_eq!(
            parameters.len(),
            gradients.len(),
            "Parameters and gradients must have the same length"
        );

        let state = self
            .moments
            .entry(key.to_string())
            .or_insert_with(|| Moments {
                m: vec![0.0; parameters.len()],
                v: vec![0.0; parameters.len()],
                t: 0,
            });

        state.t += 1;
        let bias_correction1 = 1.0 - self.beta1.powi(state.t);
        let bias_correction2 = 1.0 - self.beta2.powi(state.t);

        for i in 0..parameters.len() {
            let g = gradients[i];
            state.m[i] = self.beta1 * state.m[i] + (1.0 - self.beta1) * g;
            state.v[i] = self.beta2 * state.v[i] + (1.0 - self.beta2) * g * g;

            let m_hat = state.m[i] / bias_correction1;
            let v_hat = state.v[i] / bias_correction2;
            parameters[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }

    fn reset(&mut self) {
        self.moments.clear();
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}
