//! Kernelised attention paths.
//!
//! * [`LinearAttention`]: unmasked, `O(n)`.
//! * [`MaskedAttention`]: causal through an explicit mask, `O(n²)`.
//! * [`PrefixCausalAttention`]: causal through running prefix sums, `O(n)`.
//! * [`DecodeState`]: the prefix sums carried across calls for incremental
//!   decoding.
//!
//! [`AttentionKernel`] binds one of the three to an [`AttentionPath`].

pub mod bidirectional;
pub mod masked;
pub mod prefix;
pub mod recurrent;

use candle_core::Tensor;

pub use bidirectional::LinearAttention;
pub use masked::MaskedAttention;
pub use prefix::PrefixCausalAttention;
pub use recurrent::DecodeState;

use crate::core::{Attention, AttentionError, AttentionPath, Config};
use crate::masks::CausalMask;

/// The attention implementation selected by an [`AttentionPath`].
#[derive(Debug)]
pub enum AttentionKernel {
    Causal(PrefixCausalAttention),
    CausalQuadratic(MaskedAttention),
    Bidirectional(LinearAttention),
}

impl AttentionKernel {
    pub fn for_path(path: AttentionPath) -> Self {
        match path {
            AttentionPath::Causal => AttentionKernel::Causal(PrefixCausalAttention::new()),
            AttentionPath::CausalQuadratic => {
                AttentionKernel::CausalQuadratic(MaskedAttention::new())
            }
            AttentionPath::Bidirectional => AttentionKernel::Bidirectional(LinearAttention::new()),
        }
    }

    pub fn path(&self) -> AttentionPath {
        match self {
            AttentionKernel::Causal(_) => AttentionPath::Causal,
            AttentionKernel::CausalQuadratic(_) => AttentionPath::CausalQuadratic,
            AttentionKernel::Bidirectional(_) => AttentionPath::Bidirectional,
        }
    }

    /// Whether callers must build a [`CausalMask`] for this kernel.
    pub fn needs_materialized_mask(&self) -> bool {
        matches!(self, AttentionKernel::CausalQuadratic(_))
    }
}

impl Attention for AttentionKernel {
    fn attend(
        &self,
        q_prime: &Tensor,
        k_prime: &Tensor,
        v: &Tensor,
        mask: Option<&CausalMask>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        match self {
            AttentionKernel::Causal(inner) => inner.attend(q_prime, k_prime, v, mask, config),
            AttentionKernel::CausalQuadratic(inner) => {
                inner.attend(q_prime, k_prime, v, mask, config)
            }
            AttentionKernel::Bidirectional(inner) => {
                inner.attend(q_prime, k_prime, v, mask, config)
            }
        }
    }
}
