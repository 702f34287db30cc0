//! Error types emitted by attention implementations.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// A mask was handed to a path that attends bidirectionally.
    #[error("the {path} attention path does not accept a mask")]
    MaskUnsupported { path: &'static str },
    /// A configuration value could not be honoured.
    #[error("invalid attention configuration: {message}")]
    InvalidConfig { message: String },
    /// A tensor operation failed inside candle.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }
}
