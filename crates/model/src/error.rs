//! Errors raised while configuring or running attention blocks.

use attention::AttentionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    /// Rejected at construction; the block cannot be built from this config.
    #[error("invalid block configuration: {0}")]
    InvalidConfig(String),
    /// Call-time inputs violated the `(batch, seq, embed_dim)` contract.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A replacement parameter did not match the shape it replaces.
    #[error("parameter {name} expects shape {expected:?}, got {actual:?}")]
    ParameterShape {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported configuration format: {0}")]
    ConfigFormat(String),
}
