//! Model checkpoints
//!
//! A checkpoint is a bincode-encoded [`Checkpoint`]: the parameter and
//! moving-statistic buffers of every layer plus the architecture and options
//! needed to rebuild the model they belong to.

use crate::architecture::ArchitectureConfig;
use crate::error::{ModelError, Result};
use crate::model::ModelOptions;
use bincode::Options;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Bumped whenever the encoded layout changes.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub model_name: String,
    pub architecture: ArchitectureConfig,
    pub options: ModelOptions,
    /// Buffers keyed `"<layer>/<buffer>"`
    pub state: BTreeMap<String, Vec<f32>>,
}

impl Checkpoint {
    pub fn new(
        model_name: &str,
        architecture: ArchitectureConfig,
        options: ModelOptions,
        state: BTreeMap<String, Vec<f32>>,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            model_name: model_name.to_string(),
            architecture,
            options,
            state,
        }
    }
}

/// Encodes `value` to `path` with bincode, creating parent directories.
pub(crate) fn write_bincode<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

/// Decodes a bincode file. Reads are bounded by the file size, so a corrupt
/// length prefix fails instead of allocating.
pub(crate) fn read_bincode<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)?;
    let limit = file.metadata()?.len();
    let reader = BufReader::new(file);
    Ok(bincode::options()
        .with_fixint_encoding()
        .with_limit(limit)
        .deserialize_from(reader)?)
}

/// Writes `checkpoint` to `path`, creating parent directories as needed.
pub fn save_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    write_bincode(path, checkpoint)?;
    debug!(
        "wrote checkpoint of '{}' ({} buffers) to {}",
        checkpoint.model_name,
        checkpoint.state.len(),
        path.display()
    );
    Ok(())
}

/// Reads a checkpoint written by [`save_checkpoint`].
///
/// # Errors
///
/// I/O and decoding errors, or [`ModelError::Checkpoint`] for a file written
/// with a different format version.
pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let checkpoint: Checkpoint = read_bincode(path)?;
    if checkpoint.format_version != FORMAT_VERSION {
        return Err(ModelError::Checkpoint(format!(
            "{}: format version {} is not supported (expected {})",
            path.display(),
            checkpoint.format_version,
            FORMAT_VERSION
        )));
    }
    Ok(checkpoint)
}
