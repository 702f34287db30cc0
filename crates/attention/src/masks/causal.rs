//! Builders for causal (no-lookahead) masks.

use candle_core::{DType, Device, Result, Tensor};

use crate::core::AttentionError;

/// Construct the raw `[seq_len, seq_len]` keep mask: `1` iff `key <= query`.
pub fn build_causal_mask(device: &Device, seq_len: usize) -> Result<Tensor> {
    let mut data = vec![0u8; seq_len * seq_len];
    for query in 0..seq_len {
        let row_start = query * seq_len;
        data[row_start..=row_start + query].fill(1);
    }
    Tensor::from_vec(data, (seq_len, seq_len), device)
}

/// Lower-triangular attention mask for one sequence length.
///
/// Built fresh for each forward pass; the same length always yields the same
/// bits, so callers are free to cache by length.
#[derive(Debug, Clone)]
pub struct CausalMask {
    seq_len: usize,
    keep: Tensor,
}

impl CausalMask {
    /// Builds the mask for `seq_len >= 1` positions.
    pub fn build(device: &Device, seq_len: usize) -> std::result::Result<Self, AttentionError> {
        if seq_len == 0 {
            return Err(AttentionError::shape("causal mask requires seq_len >= 1"));
        }
        Ok(Self {
            seq_len,
            keep: build_causal_mask(device, seq_len)?,
        })
    }

    /// Number of positions covered along each axis.
    pub fn len(&self) -> usize {
        self.seq_len
    }

    pub fn is_empty(&self) -> bool {
        self.seq_len == 0
    }

    /// Whether `query` may attend `key`.
    pub fn allows(&self, query: usize, key: usize) -> bool {
        query < self.seq_len && key <= query
    }

    /// The canonical `U8` keep mask.
    pub fn as_tensor(&self) -> &Tensor {
        &self.keep
    }

    /// `1.0` where attention is kept and `0.0` elsewhere, in `dtype`.
    pub fn to_keep_weights(&self, dtype: DType) -> Result<Tensor> {
        self.keep.to_dtype(dtype)
    }

    /// `0.0` where attention is kept and `f32::NEG_INFINITY` elsewhere.
    pub fn to_additive(&self) -> Result<Tensor> {
        let shape = (self.seq_len, self.seq_len);
        let device = self.keep.device();
        let keep = Tensor::zeros(shape, DType::F32, device)?;
        let drop = Tensor::full(f32::NEG_INFINITY, shape, device)?;
        self.keep.where_cond(&keep, &drop)
    }
}
