//! Execution backend descriptors
//!
//! A backend advertises the primitives it can execute and its preferred
//! tensor layout. The model builder checks these before building: a missing
//! primitive is fatal, a channels-first preference only produces a warning
//! and the model is built channels-last regardless.

use crate::error::{ModelError, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Memory layout of image tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// `(height, width, channels)`
    #[default]
    ChannelsLast,
    /// `(channels, height, width)`
    ChannelsFirst,
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFormat::ChannelsLast => write!(f, "channels_last"),
            DataFormat::ChannelsFirst => write!(f, "channels_first"),
        }
    }
}

/// Operations the network is assembled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Conv2D,
    SeparableConv2D,
    BatchNorm,
    MaxPooling2D,
    GlobalPooling2D,
    Dense,
}

impl Primitive {
    pub const ALL: [Primitive; 6] = [
        Primitive::Conv2D,
        Primitive::SeparableConv2D,
        Primitive::BatchNorm,
        Primitive::MaxPooling2D,
        Primitive::GlobalPooling2D,
        Primitive::Dense,
    ];
}

pub trait Backend {
    fn name(&self) -> &str;

    fn supports(&self, primitive: Primitive) -> bool;

    /// Layout the backend would like image tensors in.
    fn data_format(&self) -> DataFormat {
        DataFormat::ChannelsLast
    }
}

/// The built-in single-threaded CPU backend. Supports every primitive.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend {
    data_format: DataFormat,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A CPU backend reporting `data_format` as its preferred layout.
    pub fn with_data_format(data_format: DataFormat) -> Self {
        Self { data_format }
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn supports(&self, _primitive: Primitive) -> bool {
        true
    }

    fn data_format(&self) -> DataFormat {
        self.data_format
    }
}

/// Outcome of checking a backend against the primitives a model needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Layout the model is built with (always channels-last)
    pub data_format: DataFormat,
    /// Whether the backend asked for a different layout
    pub layout_overridden: bool,
}

/// Checks that `backend` can run every primitive in `required`.
///
/// # Errors
///
/// Returns [`ModelError::Backend`] naming the first unsupported primitive.
pub fn resolve(backend: &dyn Backend, required: &[Primitive]) -> Result<Resolution> {
    if let Some(missing) = required.iter().find(|p| !backend.supports(**p)) {
        return Err(ModelError::Backend(format!(
            "backend '{}' does not support {:?}, which this model requires",
            backend.name(),
            missing
        )));
    }

    let layout_overridden = backend.data_format() != DataFormat::ChannelsLast;
    if layout_overridden {
        warn!(
            "backend '{}' prefers the {} data format; this model is only available channels_last, \
             inputs must be laid out (height, width, channels)",
            backend.name(),
            backend.data_format()
        );
    }

    Ok(Resolution {
        data_format: DataFormat::ChannelsLast,
        layout_overridden,
    })
}
