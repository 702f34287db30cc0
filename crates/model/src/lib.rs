//! Multi-head linear-attention blocks assembled from the `layers` and
//! `attention` crates.
//!
//! [`MultiHeadAttentionBlock`] owns its projections and the shared LayerNorm;
//! forward passes borrow it immutably and [`MultiHeadAttentionBlock::update_parameters`]
//! needs `&mut`. [`AttentionStack`] chains blocks as self-attention.

pub mod block;
pub mod config;
pub mod error;
pub mod stack;

pub use block::{BlockWeights, MultiHeadAttentionBlock, PARAMETER_NAMES};
pub use config::{BlockConfig, BlockSettings, StackConfig};
pub use error::ModelError;
pub use stack::AttentionStack;
