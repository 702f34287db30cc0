//! Unmasked FAVOR+-style linear attention.
//!
//! ```text
//! KV[d, e] = Σₙ K′[n, d] · V[n, e]
//! Z[n]     = 1 / (Σ_d Q′[n, d] · Σₘ K′[m, d] + ε)
//! Out[n,e] = Σ_d Q′[n, d] · KV[d, e] · Z[n]
//! ```
//!
//! `KV` and `ΣK′` summarise the whole sequence independently of the query,
//! so the cost is linear in `n` for a fixed head dimension.

use std::sync::OnceLock;

use candle_core::{Tensor, D};

use crate::core::{working_tensor, Attention, AttentionError, Config, HeadShape};
use crate::masks::CausalMask;

/// Linear attention in which every query attends every key.
#[derive(Debug, Default)]
pub struct LinearAttention {
    first_call: OnceLock<()>,
}

impl LinearAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for LinearAttention {
    fn attend(
        &self,
        q_prime: &Tensor,
        k_prime: &Tensor,
        v: &Tensor,
        mask: Option<&CausalMask>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        if mask.is_some() {
            return Err(AttentionError::MaskUnsupported {
                path: "bidirectional",
            });
        }
        let shape = HeadShape::of(q_prime, k_prime, v)?;
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::linear init epsilon={} precision={:?}",
                config.normalizer_epsilon,
                config.precision
            );
        }

        let merged = shape.sequences();
        let (n, d, e) = (shape.seq_len, shape.head_dim, shape.value_dim);
        let q = working_tensor(q_prime, config.precision)?.reshape((merged, n, d))?;
        let k = working_tensor(k_prime, config.precision)?.reshape((merged, n, d))?;
        let v_work = working_tensor(v, config.precision)?.reshape((merged, n, e))?;

        let kv = k.transpose(1, 2)?.contiguous()?.matmul(&v_work)?;
        let k_sum = k.sum_keepdim(1)?;
        let denom = q.broadcast_mul(&k_sum)?.sum_keepdim(D::Minus1)?;
        let z = denom.affine(1.0, config.normalizer_epsilon)?.recip()?;
        let out = q.matmul(&kv)?.broadcast_mul(&z)?;

        let out = out.reshape((shape.batch, shape.num_heads, n, e))?;
        Ok(out.to_dtype(v.dtype())?)
    }
}
