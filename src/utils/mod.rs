//! Shared utilities for the model implementation
//!
//! Deterministic random number generation and activation kernels.

pub mod activations;
pub mod rng;

pub use activations::{relu_inplace, softmax_rows};
pub use rng::SimpleRng;
