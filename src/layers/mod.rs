//! Layer abstractions for neural networks
//!
//! This module provides the Layer trait and the channels-last layer types the
//! Xception topology is assembled from.

mod r#trait;
pub mod activation;
pub mod batchnorm;
pub mod conv2d;
pub mod dense;
pub mod pooling;
pub mod separable_conv2d;
pub mod shape;

// Re-export the Layer trait for convenience
pub use activation::{Activation, ActivationLayer};
pub use batchnorm::BatchNormLayer;
pub use conv2d::Conv2DLayer;
pub use dense::DenseLayer;
pub use pooling::{GlobalPooling2DLayer, MaxPooling2DLayer, PoolMode};
pub use r#trait::{Layer, LayerState};
pub use separable_conv2d::SeparableConv2DLayer;
pub use shape::{FeatureShape, Padding};
