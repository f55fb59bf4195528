//! Architecture configuration structures
//!
//! The feature extractor is described by a list of stages that can be written
//! as JSON and loaded with [`load_architecture`], so the truncated topology and
//! the full entry/middle/exit flow are just two configurations of the same
//! builder ([`ArchitectureConfig::shallow`] and [`ArchitectureConfig::deep`]).

use crate::error::{config_error, Result};
use crate::graph::{Graph, NodeId};
use crate::layers::{
    batchnorm, Activation, ActivationLayer, BatchNormLayer, Conv2DLayer, DenseLayer, FeatureShape,
    GlobalPooling2DLayer, MaxPooling2DLayer, Padding, PoolMode, SeparableConv2DLayer,
};
use crate::utils::rng::SimpleRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;

/// Configuration for a single stage of the feature extractor.
///
/// Different stage types read different fields:
///
/// - **conv**: `filters`, optional `kernel_size` (3), `stride` (1),
///   `padding` (`valid`), `activation_after` (false).
///   Builds `Conv2D → BatchNorm [→ ReLU]`.
/// - **separable_conv**: `filters`, optional `kernel_size` (3), `stride` (1),
///   `padding` (`same`), `activation_before` (true), `activation_after` (false).
///   Builds `[ReLU →] SeparableConv2D → BatchNorm [→ ReLU]`.
/// - **residual_block**: `units` (filters of each separable unit on the main
///   path), optional `activation_before` (ReLU ahead of the first unit, true),
///   `pool` (3×3 stride 2 max pooling at the end of the main path, true) and
///   `shortcut` (`"projection"` for a strided 1×1 convolution + BatchNorm,
///   `"identity"` otherwise; default `"projection"`). Both paths are summed.
///
/// # Examples
///
/// ```json
/// {
///   "stage_type": "conv",
///   "name": "block1_conv1",
///   "filters": 32,
///   "kernel_size": 3,
///   "stride": 2,
///   "activation_after": true
/// }
/// ```
///
/// ```json
/// {
///   "stage_type": "residual_block",
///   "name": "block3",
///   "units": [256, 256]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Type of stage: "conv", "separable_conv" or "residual_block"
    pub stage_type: String,
    /// Layer name, or name prefix for residual blocks
    pub name: String,

    #[serde(default)]
    pub filters: Option<usize>,
    #[serde(default)]
    pub kernel_size: Option<usize>,
    #[serde(default)]
    pub stride: Option<usize>,
    #[serde(default)]
    pub padding: Option<Padding>,
    #[serde(default)]
    pub activation_before: Option<bool>,
    #[serde(default)]
    pub activation_after: Option<bool>,

    // Residual block parameters
    #[serde(default)]
    pub units: Option<Vec<usize>>,
    #[serde(default)]
    pub pool: Option<bool>,
    #[serde(default)]
    pub shortcut: Option<String>,
}

impl StageConfig {
    fn empty(stage_type: &str, name: &str) -> Self {
        Self {
            stage_type: stage_type.to_string(),
            name: name.to_string(),
            filters: None,
            kernel_size: None,
            stride: None,
            padding: None,
            activation_before: None,
            activation_after: None,
            units: None,
            pool: None,
            shortcut: None,
        }
    }

    /// `Conv2D → BatchNorm [→ ReLU]` with valid padding.
    pub fn conv(name: &str, filters: usize, stride: usize, activation_after: bool) -> Self {
        Self {
            filters: Some(filters),
            kernel_size: Some(3),
            stride: Some(stride),
            padding: Some(Padding::Valid),
            activation_after: Some(activation_after),
            ..Self::empty("conv", name)
        }
    }

    /// `[ReLU →] SeparableConv2D → BatchNorm [→ ReLU]` with same padding.
    pub fn separable(
        name: &str,
        filters: usize,
        activation_before: bool,
        activation_after: bool,
    ) -> Self {
        Self {
            filters: Some(filters),
            kernel_size: Some(3),
            stride: Some(1),
            padding: Some(Padding::Same),
            activation_before: Some(activation_before),
            activation_after: Some(activation_after),
            ..Self::empty("separable_conv", name)
        }
    }

    /// Residual block with a pooled main path and a projection shortcut.
    pub fn entry_block(name: &str, units: &[usize], activation_before: bool) -> Self {
        Self {
            units: Some(units.to_vec()),
            activation_before: Some(activation_before),
            pool: Some(true),
            shortcut: Some("projection".to_string()),
            ..Self::empty("residual_block", name)
        }
    }

    /// Residual block with an identity shortcut and no pooling.
    pub fn middle_block(name: &str, units: &[usize]) -> Self {
        Self {
            units: Some(units.to_vec()),
            activation_before: Some(true),
            pool: Some(false),
            shortcut: Some("identity".to_string()),
            ..Self::empty("residual_block", name)
        }
    }

    fn kernel(&self) -> usize {
        self.kernel_size.unwrap_or(3)
    }

    fn stride_or_default(&self) -> usize {
        self.stride.unwrap_or(1)
    }

    fn padding_or_default(&self) -> Padding {
        match self.padding {
            Some(padding) => padding,
            None if self.stage_type.eq_ignore_ascii_case("conv") => Padding::Valid,
            None => Padding::Same,
        }
    }

    fn is_projection(&self) -> bool {
        self.shortcut
            .as_deref()
            .map_or(true, |s| s.eq_ignore_ascii_case("projection"))
    }
}

/// Configuration of the shared feature extractor.
///
/// # Example
///
/// ```json
/// {
///   "name": "model_c",
///   "stages": [
///     { "stage_type": "conv", "name": "block1_conv1", "filters": 32, "stride": 2,
///       "activation_after": true },
///     { "stage_type": "conv", "name": "block1_conv2", "filters": 32 },
///     { "stage_type": "separable_conv", "name": "block2_sepconv21", "filters": 32 }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    /// Name of the extractor sub-network
    #[serde(default = "default_extractor_name")]
    pub name: String,
    /// Stages applied in order
    pub stages: Vec<StageConfig>,
    /// Width of the extractor's own softmax classifier; defaults to the
    /// model's class count
    #[serde(default)]
    pub feature_units: Option<usize>,
    #[serde(default)]
    pub batchnorm_epsilon: Option<f32>,
    #[serde(default)]
    pub batchnorm_momentum: Option<f32>,
}

fn default_extractor_name() -> String {
    "model_c".to_string()
}

impl ArchitectureConfig {
    /// The truncated topology: two plain convolutions followed by three
    /// separable convolutions at widths 32, 64, 64.
    pub fn shallow() -> Self {
        Self {
            name: default_extractor_name(),
            stages: vec![
                StageConfig::conv("block1_conv1", 32, 2, true),
                StageConfig::conv("block1_conv2", 32, 1, false),
                StageConfig::separable("block2_sepconv21", 32, true, false),
                StageConfig::separable("block2_sepconv22", 64, true, false),
                StageConfig::separable("block2_sepconv23", 64, true, false),
            ],
            feature_units: None,
            batchnorm_epsilon: None,
            batchnorm_momentum: None,
        }
    }

    /// The full entry, middle and exit flow: residual blocks at 128, 256 and
    /// 728 filters, one middle block at 728, an exit block widening to 1024,
    /// then separable convolutions at 1536 and 2048.
    pub fn deep() -> Self {
        Self {
            name: default_extractor_name(),
            stages: vec![
                StageConfig::conv("block1_conv1", 32, 2, true),
                StageConfig::conv("block1_conv2", 32, 1, true),
                StageConfig::entry_block("block2", &[128, 128], false),
                StageConfig::entry_block("block3", &[256, 256], true),
                StageConfig::entry_block("block4", &[728, 728], true),
                StageConfig::middle_block("block5", &[728, 728, 728]),
                StageConfig::entry_block("block13", &[728, 1024], true),
                StageConfig::separable("block14_sepconv1", 1536, false, true),
                StageConfig::separable("block14_sepconv2", 2048, false, true),
            ],
            feature_units: None,
            batchnorm_epsilon: None,
            batchnorm_momentum: None,
        }
    }

    /// Shape of the last convolutional stage for a given input image shape.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the spatial size collapses below 1
    /// or a residual block cannot be summed.
    pub fn feature_shape(&self, input: FeatureShape) -> Result<FeatureShape> {
        let mut shape = input;
        for (i, stage) in self.stages.iter().enumerate() {
            shape = stage_output_shape(stage, shape)
                .map_err(|e| config_error(format!("Stage {} ('{}'): {}", i, stage.name, e)))?;
        }
        Ok(shape)
    }
}

/// Loads an architecture configuration from a JSON file.
///
/// Reads the file at `path`, deserializes it and validates the stage list.
///
/// # Examples
///
/// ```no_run
/// use multislice_xception::architecture::load_architecture;
///
/// let arch = load_architecture("config/architectures/shallow.json").unwrap();
/// assert!(!arch.stages.is_empty());
/// ```
pub fn load_architecture(path: &str) -> Result<ArchitectureConfig> {
    let contents = fs::read_to_string(path)?;
    let config: ArchitectureConfig = serde_json::from_str(&contents)?;
    validate_architecture(&config)?;
    Ok(config)
}

/// Validates an architecture configuration.
///
/// Checks that:
/// - Architecture has at least one stage
/// - Each stage has the fields its type requires, with positive sizes
/// - Stage names are unique
/// - Batch normalization hyper-parameters are in range
pub fn validate_architecture(config: &ArchitectureConfig) -> Result<()> {
    if config.stages.is_empty() {
        return Err(config_error("Architecture must have at least one stage"));
    }
    if config.name.is_empty() {
        return Err(config_error("Architecture name must not be empty"));
    }
    if config.feature_units == Some(0) {
        return Err(config_error("feature_units must be greater than 0"));
    }
    if let Some(epsilon) = config.batchnorm_epsilon {
        if !(epsilon > 0.0) {
            return Err(config_error("batchnorm_epsilon must be positive"));
        }
    }
    if let Some(momentum) = config.batchnorm_momentum {
        if !(0.0..=1.0).contains(&momentum) {
            return Err(config_error("batchnorm_momentum must be in range [0.0, 1.0]"));
        }
    }

    let mut names = HashSet::new();
    for (i, stage) in config.stages.iter().enumerate() {
        validate_stage(stage, i)?;
        if !names.insert(stage.name.as_str()) {
            return Err(config_error(format!(
                "Stage {}: duplicate stage name '{}'",
                i, stage.name
            )));
        }
    }
    Ok(())
}

fn validate_stage(stage: &StageConfig, index: usize) -> Result<()> {
    if stage.name.is_empty() {
        return Err(config_error(format!("Stage {}: name must not be empty", index)));
    }
    if stage.kernel_size == Some(0) {
        return Err(config_error(format!("Stage {}: kernel_size must be greater than 0", index)));
    }
    if stage.stride == Some(0) {
        return Err(config_error(format!("Stage {}: stride must be greater than 0", index)));
    }

    match stage.stage_type.to_lowercase().as_str() {
        "conv" | "separable_conv" => match stage.filters {
            None => Err(config_error(format!(
                "Stage {}: {} stage requires 'filters'",
                index, stage.stage_type
            ))),
            Some(0) => Err(config_error(format!(
                "Stage {}: filters must be greater than 0",
                index
            ))),
            Some(_) => Ok(()),
        },
        "residual_block" => {
            let units = stage.units.as_ref().ok_or_else(|| {
                config_error(format!("Stage {}: residual_block requires 'units'", index))
            })?;
            if units.is_empty() || units.contains(&0) {
                return Err(config_error(format!(
                    "Stage {}: units must be a non-empty list of positive filter counts",
                    index
                )));
            }
            match stage.shortcut.as_deref().map(str::to_lowercase).as_deref() {
                None | Some("projection") => Ok(()),
                Some("identity") if stage.pool.unwrap_or(true) => Err(config_error(format!(
                    "Stage {}: an identity shortcut cannot be combined with pooling",
                    index
                ))),
                Some("identity") => Ok(()),
                Some(other) => Err(config_error(format!(
                    "Stage {}: invalid shortcut '{}'. Must be one of: projection, identity",
                    index, other
                ))),
            }
        }
        _ => Err(config_error(format!(
            "Stage {}: Invalid stage type '{}'. Must be one of: conv, separable_conv, residual_block",
            index, stage.stage_type
        ))),
    }
}

fn stage_output_shape(stage: &StageConfig, input: FeatureShape) -> std::result::Result<FeatureShape, String> {
    let FeatureShape::Map { height, width, channels } = input else {
        return Err("stage needs a feature map input".to_string());
    };
    let spatial = |padding: Padding, kernel: usize, stride: usize| {
        match (
            padding.output_len(height, kernel, stride),
            padding.output_len(width, kernel, stride),
        ) {
            (Some(h), Some(w)) => Ok((h, w)),
            _ => Err(format!(
                "kernel {} stride {} collapses a {}x{} input",
                kernel, stride, height, width
            )),
        }
    };

    match stage.stage_type.to_lowercase().as_str() {
        "conv" | "separable_conv" => {
            let filters = stage.filters.unwrap_or(0);
            let (h, w) = spatial(stage.padding_or_default(), stage.kernel(), stage.stride_or_default())?;
            Ok(FeatureShape::map(h, w, filters))
        }
        "residual_block" => {
            let units = stage.units.as_deref().unwrap_or_default();
            let out_channels = units.last().copied().unwrap_or(channels);
            let (h, w) = if stage.pool.unwrap_or(true) {
                spatial(Padding::Same, 3, 2)?
            } else {
                (height, width)
            };
            if !stage.is_projection() && out_channels != channels {
                return Err(format!(
                    "identity shortcut needs {} output channels, main path has {}",
                    channels, out_channels
                ));
            }
            Ok(FeatureShape::map(h, w, out_channels))
        }
        other => Err(format!("unknown stage type '{}'", other)),
    }
}

/// What the extractor ends with after its last convolutional stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorTop {
    /// Global average pooling followed by a softmax classifier of this width
    Classifier(usize),
    /// Optional global pooling only; `None` keeps the feature map
    Pooling(Option<PoolMode>),
}

/// Builds the shared feature extractor described by `config`.
///
/// # Errors
///
/// Returns a configuration error if the architecture is invalid or does not
/// fit `input`.
///
/// # Examples
///
/// ```no_run
/// use multislice_xception::architecture::{build_feature_extractor, ArchitectureConfig, ExtractorTop};
/// use multislice_xception::layers::FeatureShape;
/// use multislice_xception::utils::SimpleRng;
///
/// let mut rng = SimpleRng::new(42);
/// let graph = build_feature_extractor(
///     &ArchitectureConfig::shallow(),
///     FeatureShape::map(80, 320, 3),
///     ExtractorTop::Classifier(40),
///     &mut rng,
/// ).unwrap();
/// assert_eq!(graph.output_shape(), FeatureShape::Vector(40));
/// ```
pub fn build_feature_extractor(
    config: &ArchitectureConfig,
    input: FeatureShape,
    top: ExtractorTop,
    rng: &mut SimpleRng,
) -> Result<Graph> {
    validate_architecture(config)?;
    config.feature_shape(input)?;

    let mut builder = GraphBuilder {
        graph: Graph::new(&config.name, input),
        rng,
        bn_epsilon: config.batchnorm_epsilon.unwrap_or(batchnorm::DEFAULT_EPSILON),
        bn_momentum: config.batchnorm_momentum.unwrap_or(batchnorm::DEFAULT_MOMENTUM),
    };

    let mut x = builder.graph.input();
    for stage in &config.stages {
        x = builder.stage(x, stage)?;
    }

    match top {
        ExtractorTop::Classifier(units) => {
            x = builder.global_pool(x, "avg_pool_", PoolMode::Avg)?;
            x = builder.dense(x, "predictions_", units)?;
            builder.activation(x, "predictions__softmax", Activation::Softmax)?;
        }
        ExtractorTop::Pooling(Some(PoolMode::Avg)) => {
            builder.global_pool(x, "avg_pool", PoolMode::Avg)?;
        }
        ExtractorTop::Pooling(Some(PoolMode::Max)) => {
            builder.global_pool(x, "max_pool", PoolMode::Max)?;
        }
        ExtractorTop::Pooling(None) => {}
    }

    Ok(builder.graph)
}

/// Builds a per-slice classifier head: `Dense(units) → softmax`.
pub fn build_head(name: &str, input: FeatureShape, units: usize, rng: &mut SimpleRng) -> Result<Graph> {
    if units == 0 {
        return Err(config_error(format!("{}: head needs at least one unit", name)));
    }
    let mut builder = GraphBuilder {
        graph: Graph::new(name, input),
        rng,
        bn_epsilon: batchnorm::DEFAULT_EPSILON,
        bn_momentum: batchnorm::DEFAULT_MOMENTUM,
    };
    let x = builder.dense(builder.graph.input(), name, units)?;
    builder.activation(x, &format!("{}_softmax", name), Activation::Softmax)?;
    Ok(builder.graph)
}

struct GraphBuilder<'a> {
    graph: Graph,
    rng: &'a mut SimpleRng,
    bn_epsilon: f32,
    bn_momentum: f32,
}

impl GraphBuilder<'_> {
    fn shape(&self, node: NodeId) -> FeatureShape {
        self.graph.node_shape(node)
    }

    fn stage(&mut self, x: NodeId, stage: &StageConfig) -> Result<NodeId> {
        let name = stage.name.as_str();
        match stage.stage_type.to_lowercase().as_str() {
            "conv" => {
                let filters = stage.filters.unwrap_or(0);
                let mut x = self.conv(
                    x,
                    name,
                    filters,
                    stage.kernel(),
                    stage.stride_or_default(),
                    stage.padding_or_default(),
                )?;
                x = self.batchnorm(x, &format!("{}_bn", name))?;
                if stage.activation_after.unwrap_or(false) {
                    x = self.activation(x, &format!("{}_act", name), Activation::Relu)?;
                }
                Ok(x)
            }
            "separable_conv" => {
                let mut x = x;
                if stage.activation_before.unwrap_or(true) {
                    x = self.activation(x, &format!("{}_act", name), Activation::Relu)?;
                }
                x = self.separable(
                    x,
                    name,
                    stage.filters.unwrap_or(0),
                    stage.kernel(),
                    stage.stride_or_default(),
                    stage.padding_or_default(),
                )?;
                x = self.batchnorm(x, &format!("{}_bn", name))?;
                if stage.activation_after.unwrap_or(false) {
                    x = self.activation(x, &format!("{}_post_act", name), Activation::Relu)?;
                }
                Ok(x)
            }
            "residual_block" => self.residual_block(x, stage),
            other => Err(config_error(format!("Invalid stage type '{}'", other))),
        }
    }

    fn residual_block(&mut self, input: NodeId, stage: &StageConfig) -> Result<NodeId> {
        let name = stage.name.as_str();
        let units = stage.units.as_deref().unwrap_or_default();
        let pool = stage.pool.unwrap_or(true);

        let shortcut = if stage.is_projection() {
            let filters = units.last().copied().unwrap_or(0);
            let stride = if pool { 2 } else { 1 };
            let s = self.conv(
                input,
                &format!("{}_shortcut", name),
                filters,
                1,
                stride,
                Padding::Same,
            )?;
            self.batchnorm(s, &format!("{}_shortcut_bn", name))?
        } else {
            input
        };

        let mut x = input;
        for (i, &filters) in units.iter().enumerate() {
            let unit = format!("{}_sepconv{}", name, i + 1);
            if i > 0 || stage.activation_before.unwrap_or(true) {
                x = self.activation(x, &format!("{}_act", unit), Activation::Relu)?;
            }
            x = self.separable(x, &unit, filters, 3, 1, Padding::Same)?;
            x = self.batchnorm(x, &format!("{}_bn", unit))?;
        }
        if pool {
            let layer = MaxPooling2DLayer::new(&format!("{}_pool", name), self.shape(x), 3, 2, Padding::Same)?;
            x = self.graph.add_layer(x, Box::new(layer))?;
        }

        self.graph.add_sum(x, shortcut)
    }

    fn conv(
        &mut self,
        x: NodeId,
        name: &str,
        filters: usize,
        kernel_size: usize,
        stride: usize,
        padding: Padding,
    ) -> Result<NodeId> {
        let layer = Conv2DLayer::new(name, self.shape(x), filters, kernel_size, stride, padding, false, self.rng)?;
        self.graph.add_layer(x, Box::new(layer))
    }

    fn separable(
        &mut self,
        x: NodeId,
        name: &str,
        filters: usize,
        kernel_size: usize,
        stride: usize,
        padding: Padding,
    ) -> Result<NodeId> {
        let layer =
            SeparableConv2DLayer::new(name, self.shape(x), filters, kernel_size, stride, padding, self.rng)?;
        self.graph.add_layer(x, Box::new(layer))
    }

    fn batchnorm(&mut self, x: NodeId, name: &str) -> Result<NodeId> {
        let layer = BatchNormLayer::new(name, self.shape(x), self.bn_epsilon, self.bn_momentum);
        self.graph.add_layer(x, Box::new(layer))
    }

    fn activation(&mut self, x: NodeId, name: &str, activation: Activation) -> Result<NodeId> {
        let layer = ActivationLayer::new(name, self.shape(x), activation);
        self.graph.add_layer(x, Box::new(layer))
    }

    fn global_pool(&mut self, x: NodeId, name: &str, mode: PoolMode) -> Result<NodeId> {
        let layer = GlobalPooling2DLayer::new(name, self.shape(x), mode)?;
        self.graph.add_layer(x, Box::new(layer))
    }

    fn dense(&mut self, x: NodeId, name: &str, units: usize) -> Result<NodeId> {
        let layer = DenseLayer::new(name, self.shape(x), units, self.rng);
        self.graph.add_layer(x, Box::new(layer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_shallow_feature_shape() {
        let arch = ArchitectureConfig::shallow();
        let shape = arch.feature_shape(FeatureShape::map(80, 320, 3)).unwrap();
        assert_eq!(shape, FeatureShape::map(37, 157, 64));
    }

    #[test]
    fn test_deep_feature_shape() {
        let arch = ArchitectureConfig::deep();
        validate_architecture(&arch).unwrap();
        // 37x157 -> 19x79 -> 10x40 -> 5x20 -> 5x20 -> 3x10
        let shape = arch.feature_shape(FeatureShape::map(80, 320, 3)).unwrap();
        assert_eq!(shape, FeatureShape::map(3, 10, 2048));
    }

    #[test]
    fn test_feature_shape_rejects_tiny_input() {
        let arch = ArchitectureConfig::shallow();
        assert!(arch.feature_shape(FeatureShape::map(4, 4, 3)).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_stages() {
        let mut arch = ArchitectureConfig::shallow();
        arch.stages[2].filters = Some(0);
        assert!(validate_architecture(&arch).is_err());

        let mut arch = ArchitectureConfig::shallow();
        arch.stages[1].name = "block1_conv1".to_string();
        assert!(validate_architecture(&arch).is_err());

        let mut arch = ArchitectureConfig::shallow();
        arch.stages[0].stage_type = "lstm".to_string();
        assert!(validate_architecture(&arch).is_err());

        let mut arch = ArchitectureConfig::deep();
        arch.stages[5].pool = Some(true);
        assert!(validate_architecture(&arch).is_err());

        let arch = ArchitectureConfig {
            stages: vec![],
            ..ArchitectureConfig::shallow()
        };
        assert!(validate_architecture(&arch).is_err());
    }

    #[test]
    fn test_load_architecture_roundtrip_json() {
        let json = serde_json::to_string_pretty(&ArchitectureConfig::deep()).unwrap();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        let loaded = load_architecture(file.path().to_str().unwrap()).unwrap();
        assert_eq!(loaded, ArchitectureConfig::deep());
    }

    #[test]
    fn test_load_architecture_defaults() {
        let json = r#"{
            "stages": [
                { "stage_type": "conv", "name": "stem", "filters": 4 },
                { "stage_type": "separable_conv", "name": "sep", "filters": 8 }
            ]
        }"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        let arch = load_architecture(file.path().to_str().unwrap()).unwrap();
        assert_eq!(arch.name, "model_c");
        // conv defaults to valid padding, separable to same
        let shape = arch.feature_shape(FeatureShape::map(10, 12, 3)).unwrap();
        assert_eq!(shape, FeatureShape::map(8, 10, 8));
    }

    #[test]
    fn test_build_shallow_extractor() {
        let mut rng = SimpleRng::new(42);
        let graph = build_feature_extractor(
            &ArchitectureConfig::shallow(),
            FeatureShape::map(80, 320, 3),
            ExtractorTop::Classifier(40),
            &mut rng,
        )
        .unwrap();
        assert_eq!(graph.name(), "model_c");
        assert_eq!(graph.output_shape(), FeatureShape::Vector(40));
        let names = graph.layer_names();
        for expected in ["block1_conv1", "block1_conv2_bn", "block2_sepconv23", "avg_pool_", "predictions_"] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
    }

    #[test]
    fn test_build_without_top() {
        let mut rng = SimpleRng::new(42);
        let arch = ArchitectureConfig::shallow();
        let input = FeatureShape::map(12, 20, 3);

        let map = build_feature_extractor(&arch, input, ExtractorTop::Pooling(None), &mut rng).unwrap();
        assert_eq!(map.output_shape(), FeatureShape::map(3, 7, 64));

        let pooled =
            build_feature_extractor(&arch, input, ExtractorTop::Pooling(Some(PoolMode::Max)), &mut rng)
                .unwrap();
        assert_eq!(pooled.output_shape(), FeatureShape::Vector(64));
    }

    #[test]
    fn test_build_residual_blocks() {
        let mut rng = SimpleRng::new(1);
        let arch = ArchitectureConfig {
            stages: vec![
                StageConfig::conv("stem", 4, 1, true),
                StageConfig::entry_block("entry", &[8, 8], false),
                StageConfig::middle_block("middle", &[8, 8, 8]),
            ],
            ..ArchitectureConfig::shallow()
        };
        let graph = build_feature_extractor(
            &arch,
            FeatureShape::map(10, 10, 3),
            ExtractorTop::Pooling(None),
            &mut rng,
        )
        .unwrap();
        // 10 -> 8 (valid stem) -> 4 (pooled entry block)
        assert_eq!(graph.output_shape(), FeatureShape::map(4, 4, 8));
        assert!(graph.layer("entry_shortcut").is_some());
        assert!(graph.layer("entry_pool").is_some());
        assert!(graph.layer("middle_shortcut").is_none());

        let input = vec![0.1f32; 2 * 10 * 10 * 3];
        let trace = graph.forward(&input, 2).unwrap();
        assert_eq!(trace.output().len(), 2 * 4 * 4 * 8);
    }

    #[test]
    fn test_build_head() {
        let mut rng = SimpleRng::new(5);
        let head = build_head("predictions0", FeatureShape::Vector(40), 40, &mut rng).unwrap();
        assert_eq!(head.output_shape(), FeatureShape::Vector(40));
        assert_eq!(head.parameter_count(), 40 * 40 + 40);
        assert!(build_head("bad", FeatureShape::Vector(40), 0, &mut rng).is_err());
    }
}
