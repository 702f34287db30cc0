//! Core traits and types shared across attention implementations.
//!
//! Every path consumes kernel features `Q′`, `K′` shaped
//! `[batch, n_heads, seq_len, head_dim]` together with values shaped
//! `[batch, n_heads, seq_len, value_dim]`, and returns a tensor with the layout
//! and dtype of the values.

pub mod config;
pub mod errors;

use candle_core::{DType, Tensor};

pub use config::{AttentionPath, Config, PrecisionPolicy, DEFAULT_NORMALIZER_EPSILON};
pub use errors::AttentionError;

use crate::masks::CausalMask;

/// Unified interface for the kernelised attention paths.
///
/// * `q_prime` and `k_prime` are kernel features (see
///   [`KernelTransform`](crate::kernel::KernelTransform)) sharing the layout
///   `[batch, n_heads, seq_len, head_dim]`.
/// * `v` is `[batch, n_heads, seq_len, value_dim]`.
/// * `mask`, when present, must cover exactly `seq_len` positions.
/// * The output is `[batch, n_heads, seq_len, value_dim]` in `v`'s dtype.
pub trait Attention {
    fn attend(
        &self,
        q_prime: &Tensor,
        k_prime: &Tensor,
        v: &Tensor,
        mask: Option<&CausalMask>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}

/// Logical description of a head-split attention invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadShape {
    pub batch: usize,
    pub num_heads: usize,
    pub seq_len: usize,
    pub head_dim: usize,
    pub value_dim: usize,
}

impl HeadShape {
    /// Validates q′, k′, v against each other and returns their common shape.
    pub fn of(q_prime: &Tensor, k_prime: &Tensor, v: &Tensor) -> Result<Self, AttentionError> {
        let device = q_prime.device();
        if !device.same_device(k_prime.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::shape("q, k, v must reside on the same device"));
        }

        let dtype = q_prime.dtype();
        if dtype != k_prime.dtype() || dtype != v.dtype() {
            return Err(AttentionError::shape("q, k, v must share the same dtype"));
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let (batch, num_heads, seq_len, head_dim) = q_prime.dims4().map_err(|_| {
            AttentionError::shape("q must have shape [batch, heads, seq_len, head_dim]")
        })?;
        let k_dims = k_prime.dims4().map_err(|_| {
            AttentionError::shape("k must have shape [batch, heads, seq_len, head_dim]")
        })?;
        let (vb, vh, vn, value_dim) = v.dims4().map_err(|_| {
            AttentionError::shape("v must have shape [batch, heads, seq_len, value_dim]")
        })?;

        if k_dims != (batch, num_heads, seq_len, head_dim) {
            return Err(AttentionError::shape(format!(
                "k shape mismatch: expected [{batch}, {num_heads}, {seq_len}, {head_dim}] got {k_dims:?}"
            )));
        }
        if (vb, vh, vn) != (batch, num_heads, seq_len) {
            return Err(AttentionError::shape(format!(
                "v shape mismatch: expected [{batch}, {num_heads}, {seq_len}, _] got [{vb}, {vh}, {vn}, {value_dim}]"
            )));
        }
        if batch == 0 || num_heads == 0 || seq_len == 0 || head_dim == 0 || value_dim == 0 {
            return Err(AttentionError::shape(format!(
                "attention dimensions must be non-zero, got q {:?} v {:?}",
                q_prime.dims(),
                v.dims()
            )));
        }

        Ok(Self {
            batch,
            num_heads,
            seq_len,
            head_dim,
            value_dim,
        })
    }

    /// Number of independent `(batch, head)` sequences.
    pub fn sequences(&self) -> usize {
        self.batch * self.num_heads
    }

    /// Checks that a mask covers exactly this invocation's sequence length
    /// and lives on the same device as `reference`.
    pub fn check_mask(&self, mask: &CausalMask, reference: &Tensor) -> Result<(), AttentionError> {
        if mask.len() != self.seq_len {
            return Err(AttentionError::shape(format!(
                "mask covers {} positions but the sequence has {}",
                mask.len(),
                self.seq_len
            )));
        }
        if !reference.device().same_device(mask.as_tensor().device()) {
            return Err(AttentionError::shape("mask must reside on the same device as q"));
        }
        Ok(())
    }
}

/// Casts a tensor to the dtype the attention algebra runs in.
pub(crate) fn working_tensor(
    tensor: &Tensor,
    policy: PrecisionPolicy,
) -> candle_core::Result<Tensor> {
    match policy {
        PrecisionPolicy::ForceF32 if tensor.dtype() != DType::F32 => tensor.to_dtype(DType::F32),
        _ => Ok(tensor.clone()),
    }
}
