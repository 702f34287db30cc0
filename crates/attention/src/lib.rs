//! Kernelised linear attention with causal masking.
//!
//! Queries and keys are mapped through a positive feature map
//! ([`KernelTransform`]) so that attention factorises as
//! `φ(Q) (φ(K)ᵀ V)` and runs in time linear in the sequence length. Tensors use
//! the layout `[batch, n_heads, seq_len, head_dim]`; reductions run in `f32` and
//! the output matches the value dtype.
//!
//! Three aggregation paths are provided, selected through
//! [`AttentionPath`]:
//!
//! * `Causal` (default): prefix-sum causal attention, `O(n)`.
//! * `CausalQuadratic`: explicit [`CausalMask`] over the `n × n` kernel scores.
//! * `Bidirectional`: unmasked linear attention.
//!
//! [`DecodeState`] exposes the causal prefix sums for token-by-token decoding.

pub mod core;
pub mod kernel;
pub mod linear;
pub mod masks;

pub use crate::core::{
    Attention, AttentionError, AttentionPath, Config, HeadShape, PrecisionPolicy,
    DEFAULT_NORMALIZER_EPSILON,
};
pub use kernel::{KernelTransform, DEFAULT_KERNEL_EPSILON};
pub use linear::{
    AttentionKernel, DecodeState, LinearAttention, MaskedAttention, PrefixCausalAttention,
};
pub use masks::{build_causal_mask, CausalMask};
