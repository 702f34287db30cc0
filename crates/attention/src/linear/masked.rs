//! Causal linear attention through an explicit kernel score matrix.
//!
//! ```text
//! A   = (Q′ K′ᵀ) ⊙ M
//! Out = (A V) / (rowsum(A) + ε)
//! ```
//!
//! Numerically this is the prefix-sum path, but it materialises the
//! `n × n` scores and therefore costs `O(n²)` per head. It accepts any
//! [`CausalMask`] and serves as the reference the prefix path is checked
//! against.

use std::sync::OnceLock;

use candle_core::{Tensor, D};

use crate::core::{working_tensor, Attention, AttentionError, Config, HeadShape};
use crate::masks::CausalMask;

/// Quadratic masked attention.
#[derive(Debug, Default)]
pub struct MaskedAttention {
    first_call: OnceLock<()>,
}

impl MaskedAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for MaskedAttention {
    /// Without a mask every query attends every key, reproducing
    /// [`LinearAttention`](super::LinearAttention) at quadratic cost.
    fn attend(
        &self,
        q_prime: &Tensor,
        k_prime: &Tensor,
        v: &Tensor,
        mask: Option<&CausalMask>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        let shape = HeadShape::of(q_prime, k_prime, v)?;
        if let Some(mask) = mask {
            shape.check_mask(mask, q_prime)?;
        }
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::masked init epsilon={} precision={:?} masked={}",
                config.normalizer_epsilon,
                config.precision,
                mask.is_some()
            );
        }

        let merged = shape.sequences();
        let (n, d, e) = (shape.seq_len, shape.head_dim, shape.value_dim);
        let q = working_tensor(q_prime, config.precision)?.reshape((merged, n, d))?;
        let k = working_tensor(k_prime, config.precision)?.reshape((merged, n, d))?;
        let v_work = working_tensor(v, config.precision)?.reshape((merged, n, e))?;

        let mut scores = q.matmul(&k.transpose(1, 2)?.contiguous()?)?;
        if let Some(mask) = mask {
            let keep = mask.to_keep_weights(scores.dtype())?;
            scores = scores.broadcast_mul(&keep)?;
        }

        let numerator = scores.matmul(&v_work)?;
        let denom = scores
            .sum_keepdim(D::Minus1)?
            .affine(1.0, config.normalizer_epsilon)?;
        let out = numerator.broadcast_div(&denom)?;

        let out = out.reshape((shape.batch, shape.num_heads, n, e))?;
        Ok(out.to_dtype(v.dtype())?)
    }
}
