use std::{fs, path::Path};

use attention::{AttentionPath, Config as AttentionConfig};
use candle_core::{DType, Device};
use layers::{LinearInit, DEFAULT_LAYER_NORM_EPSILON};
use serde::Deserialize;

use crate::error::ModelError;

/// Runtime configuration for a single [`MultiHeadAttentionBlock`](crate::MultiHeadAttentionBlock).
#[derive(Debug, Clone)]
pub struct BlockConfig {
    pub embed_dim: usize,
    pub num_heads: usize,
    /// ε of the shared LayerNorm.
    pub layer_norm_epsilon: f64,
    pub attention: AttentionConfig,
    pub dtype: DType,
    pub device: Device,
}

impl BlockConfig {
    /// F32 on the CPU with default attention settings.
    pub fn new(embed_dim: usize, num_heads: usize) -> Self {
        Self {
            embed_dim,
            num_heads,
            layer_norm_epsilon: DEFAULT_LAYER_NORM_EPSILON,
            attention: AttentionConfig::default(),
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    pub fn with_path(mut self, path: AttentionPath) -> Self {
        self.attention.path = path;
        self
    }

    /// Width of a single head. Only meaningful once [`validate`](Self::validate) passes.
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads.max(1)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.embed_dim == 0 {
            return Err(ModelError::InvalidConfig(
                "embed_dim must be greater than zero".into(),
            ));
        }
        if self.num_heads == 0 {
            return Err(ModelError::InvalidConfig(
                "num_heads must be greater than zero".into(),
            ));
        }
        if self.embed_dim % self.num_heads != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "embed_dim ({}) must be divisible by num_heads ({})",
                self.embed_dim, self.num_heads
            )));
        }
        if !(self.layer_norm_epsilon.is_finite() && self.layer_norm_epsilon > 0.0) {
            return Err(ModelError::InvalidConfig(format!(
                "layer_norm_epsilon must be positive and finite, got {}",
                self.layer_norm_epsilon
            )));
        }
        if !matches!(self.dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(ModelError::InvalidConfig(format!(
                "dtype must be f32, f16 or bf16, got {:?}",
                self.dtype
            )));
        }
        self.attention
            .validate()
            .map_err(|err| ModelError::InvalidConfig(err.to_string()))
    }
}

/// Configuration for an [`AttentionStack`](crate::AttentionStack) of identical blocks.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub block: BlockConfig,
    pub num_layers: usize,
    pub init: LinearInit,
}

impl StackConfig {
    pub fn new(block: BlockConfig, num_layers: usize) -> Self {
        Self {
            block,
            num_layers,
            init: LinearInit::XavierUniform,
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.num_layers == 0 {
            return Err(ModelError::InvalidConfig(
                "num_layers must be greater than zero".into(),
            ));
        }
        self.block.validate()
    }
}

fn default_layer_norm_epsilon() -> f64 {
    DEFAULT_LAYER_NORM_EPSILON
}

fn default_normalizer_epsilon() -> f64 {
    attention::DEFAULT_NORMALIZER_EPSILON
}

fn default_dtype() -> String {
    "f32".to_string()
}

fn default_num_layers() -> usize {
    1
}

/// On-disk form of a block (and stack) configuration.
///
/// ```toml
/// embed_dim = 512
/// num_heads = 8
/// attention_path = "causal"
/// dtype = "bf16"
/// num_layers = 6
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BlockSettings {
    pub embed_dim: usize,
    pub num_heads: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default)]
    pub attention_path: Option<String>,
    #[serde(default = "default_normalizer_epsilon")]
    pub normalizer_epsilon: f64,
    #[serde(default = "default_dtype")]
    pub dtype: String,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
}

impl BlockSettings {
    /// Loads settings from a `.toml` (default) or `.json` file and validates them.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());

        let settings: BlockSettings = match extension.as_deref() {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(ModelError::ConfigFormat(format!(
                    "unsupported extension `.{other}` for {}",
                    path.display()
                )))
            }
        };

        // Resolving catches bad heads, epsilons and names before anything is built.
        settings.into_stack_config(&Device::Cpu)?;
        Ok(settings)
    }

    fn parse_dtype(&self) -> Result<DType, ModelError> {
        match self.dtype.to_ascii_lowercase().as_str() {
            "f32" => Ok(DType::F32),
            "f16" => Ok(DType::F16),
            "bf16" => Ok(DType::BF16),
            other => Err(ModelError::InvalidConfig(format!(
                "unknown dtype `{other}` (expected f32, f16 or bf16)"
            ))),
        }
    }

    /// Resolves the file form; environment overrides win over file values.
    pub fn into_block_config(&self, device: &Device) -> Result<BlockConfig, ModelError> {
        let mut attention = AttentionConfig {
            normalizer_epsilon: self.normalizer_epsilon,
            ..AttentionConfig::default()
        };
        if let Some(raw) = &self.attention_path {
            attention.path = raw.parse()?;
        }
        attention.apply_env_overrides();

        let config = BlockConfig {
            embed_dim: self.embed_dim,
            num_heads: self.num_heads,
            layer_norm_epsilon: self.layer_norm_epsilon,
            attention,
            dtype: self.parse_dtype()?,
            device: device.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn into_stack_config(&self, device: &Device) -> Result<StackConfig, ModelError> {
        let config = StackConfig::new(self.into_block_config(device)?, self.num_layers);
        config.validate()?;
        Ok(config)
    }
}
