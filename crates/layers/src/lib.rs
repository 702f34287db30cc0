//! Building blocks shared by the attention block: dense projections, layer
//! normalisation, and the dtype policy that governs their casts.
//!
//! All layers are assembled from Candle primitives and follow the
//! `(batch, seq, hidden)` activation layout.

pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod norm;

pub use dtypes::ComputePolicy;
pub use linear::{Linear, LinearConfig, LinearInit};
pub use norm::{LayerNorm, NormConfig, DEFAULT_LAYER_NORM_EPSILON};
