//! Optimizer abstractions for neural network parameter updates
//!
//! Optimizers turn accumulated gradients into parameter updates. Stateful
//! optimizers keep their slot variables (momentum, squared-gradient averages,
//! ...) per parameter buffer, keyed by the buffer's checkpoint name, so one
//! optimizer instance can drive every layer of a model.
//!
//! # Available Optimizers
//!
//! - `Adadelta`: the optimizer the model is compiled with by default
//! - `Adam`: adaptive moment estimation
//! - `SGD`: gradient descent with optional momentum
//!
//! # Example
//!
//! ```ignore
//! use multislice_xception::optimizers::{Optimizer, Adadelta};
//!
//! let mut optimizer = Adadelta::default();
//! optimizer.update("predictions0/kernel", &mut weights, &gradients);
//! ```

pub mod adadelta;
pub mod adam;
pub mod sgd;

pub use adadelta::Adadelta;
pub use adam::Adam;
pub use sgd::SGD;

use crate::error::{config_error, Result};
use serde::{Deserialize, Serialize};

/// Core trait for neural network optimizers.
pub trait Optimizer {
    /// Algorithm name as used in configuration files (`"adadelta"`, ...).
    fn name(&self) -> &'static str;

    /// Update `parameters` in place from `gradients`.
    ///
    /// `key` identifies the parameter buffer; optimizers with per-parameter
    /// state allocate it on the first update of a key.
    ///
    /// # Panics
    ///
    /// Implementations panic if `parameters` and `gradients` differ in length.
    fn update(&mut self, key: &str, parameters: &mut [f32], gradients: &[f32]);

    /// Clear all accumulated optimizer state.
    fn reset(&mut self);

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);
}

/// Optimizer selection and hyper-parameters, as found in training configs.
///
/// Unset fields fall back to the Keras defaults of the chosen algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// `"adadelta"`, `"adam"` or `"sgd"`
    pub name: String,
    pub learning_rate: Option<f32>,
    /// Adadelta decay factor
    pub rho: Option<f32>,
    pub epsilon: Option<f32>,
    /// Adam first-moment decay
    pub beta1: Option<f32>,
    /// Adam second-moment decay
    pub beta2: Option<f32>,
    /// SGD momentum
    pub momentum: Option<f32>,
}

impl OptimizerConfig {
    /// Config selecting `name` with default hyper-parameters.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            learning_rate: None,
            rho: None,
            epsilon: None,
            beta1: None,
            beta2: None,
            momentum: None,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::named("adadelta")
    }
}

/// Instantiates the optimizer described by `config`.
///
/// # Errors
///
/// Returns a configuration error for unknown names or out-of-range
/// hyper-parameters.
pub fn build_optimizer(config: &OptimizerConfig) -> Result<Box<dyn Optimizer>> {
    if let Some(lr) = config.learning_rate {
        if !(lr >= 0.0) {
            return Err(config_error("learning_rate must be non-negative"));
        }
    }
    if let Some(epsilon) = config.epsilon {
        if !(epsilon > 0.0) {
            return Err(config_error("epsilon must be positive"));
        }
    }

    match config.name.to_lowercase().as_str() {
        "adadelta" => {
            let rho = config.rho.unwrap_or(adadelta::DEFAULT_RHO);
            if !(0.0..1.0).contains(&rho) {
                return Err(config_error("rho must be in range [0.0, 1.0)"));
            }
            Ok(Box::new(Adadelta::new(
                config.learning_rate.unwrap_or(adadelta::DEFAULT_LEARNING_RATE),
                rho,
                config.epsilon.unwrap_or(adadelta::DEFAULT_EPSILON),
            )))
        }
        "adam" => {
            let beta1 = config.beta1.unwrap_or(0.9);
            let beta2 = config.beta2.unwrap_or(0.999);
            if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) {
                return Err(config_error("beta1 and beta2 must be in range [0.0, 1.0)"));
            }
            Ok(Box::new(Adam::new(
                config.learning_rate.unwrap_or(0.001),
                beta1,
                beta2,
                config.epsilon.unwrap_or(1e-7),
            )))
        }
        "sgd" => {
            let momentum = config.momentum.unwrap_or(0.0);
            if !(0.0..1.0).contains(&momentum) {
                return Err(config_error("momentum must be in range [0.0, 1.0)"));
            }
            Ok(Box::new(SGD::with_momentum(
                config.learning_rate.unwrap_or(0.01),
                momentum,
            )))
        }
        other => Err(config_error(format!(
            "Invalid optimizer '{}'. Must be one of: adadelta, adam, sgd",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_default_is_adadelta() {
        let optimizer = build_optimizer(&OptimizerConfig::default()).unwrap();
        assert_eq!(optimizer.name(), "adadelta");
        assert_eq!(optimizer.learning_rate(), 1.0);
    }

    #[test]
    fn test_build_is_case_insensitive() {
        let optimizer = build_optimizer(&OptimizerConfig::named("Adam")).unwrap();
        assert_eq!(optimizer.name(), "adam");
    }

    #[test]
    fn test_build_rejects_unknown_optimizer() {
        assert!(build_optimizer(&OptimizerConfig::named("rmsprop")).is_err());
    }

    #[test]
    fn test_build_rejects_bad_hyper_parameters() {
        let mut config = OptimizerConfig::named("sgd");
        config.momentum = Some(1.5);
        assert!(build_optimizer(&config).is_err());

        let mut config = OptimizerConfig::named("adadelta");
        config.learning_rate = Some(-1.0);
        assert!(build_optimizer(&config).is_err());
    }
}
