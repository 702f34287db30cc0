//! Mask utilities shared by attention implementations.
//!
//! The canonical mask is a `U8` tensor shaped `[seq_len, seq_len]` holding `1`
//! where query `i` may attend key `j` and `0` otherwise. Linear attention
//! consumes it multiplicatively (see [`CausalMask::to_keep_weights`]); an
//! additive `0.0` / `f32::NEG_INFINITY` view is available for softmax-style
//! consumers.

pub mod causal;

use candle_core::DType;

/// Dtype of the canonical keep/drop mask.
pub const MASK_DTYPE: DType = DType::U8;

pub use causal::{build_causal_mask, CausalMask};
