//! Causal linear attention in `O(n)` via running prefix sums.
//!
//! Query `i` needs `Σ_{j≤i} K′ⱼ ⊗ Vⱼ` and `Σ_{j≤i} K′ⱼ`. Both are prefixes of
//! a single forward scan, so the causal restriction costs nothing over the
//! unmasked path and the `n × n` mask is never materialised.

use std::sync::OnceLock;

use candle_core::Tensor;

use crate::core::{Attention, AttentionError, Config, HeadShape};
use crate::linear::recurrent::DecodeState;
use crate::masks::CausalMask;

/// Prefix-sum causal attention.
#[derive(Debug, Default)]
pub struct PrefixCausalAttention {
    first_call: OnceLock<()>,
}

impl PrefixCausalAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for PrefixCausalAttention {
    /// The causal structure is implicit; a supplied mask is only checked for
    /// a matching length.
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
                "attention::prefix init epsilon={} heads={} head_dim={} value_dim={}",
                config.normalizer_epsilon,
                shape.num_heads,
                shape.head_dim,
                shape.value_dim
            );
        }

        let mut state = DecodeState::new(
            shape.batch,
            shape.num_heads,
            shape.head_dim,
            shape.value_dim,
        );
        state.step(q_prime, k_prime, v, config)
    }
}
