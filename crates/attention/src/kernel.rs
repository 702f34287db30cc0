//! Positive feature maps applied to queries and keys.
//!
//! Linear attention replaces `exp(q·k)` with `φ(q)·φ(k)` for an elementwise
//! map `φ` whose output is strictly positive. Positivity is what keeps the
//! normaliser `φ(q)·Σφ(k) + ε` away from zero. The built-in `Relu` and `Elu`
//! maps guarantee it; `Shifted` and `Custom` leave it to the caller.

use std::{fmt, sync::Arc};

use candle_core::Tensor;

use crate::core::AttentionError;

/// Floor added to every feature so that no element is exactly zero.
pub const DEFAULT_KERNEL_EPSILON: f64 = 1e-6;

/// Signature accepted by [`KernelTransform::custom`].
pub type KernelFn = dyn Fn(&Tensor) -> candle_core::Result<Tensor> + Send + Sync;

/// Elementwise feature map `φ` used by every attention path.
#[derive(Clone)]
pub enum KernelTransform {
    /// `max(x, 0) + ε`.
    Relu { epsilon: f64 },
    /// `elu(x) + 1 + ε`, evaluated as `max(x, 0) + exp(min(x, 0)) + ε` so the
    /// `-1 + 1` never cancels in half precision.
    Elu { epsilon: f64 },
    /// `x + ε`. Only positive for inputs above `-ε`.
    Shifted { epsilon: f64 },
    /// Caller-supplied map. It must preserve shape and should return
    /// strictly positive values; positivity is not checked.
    Custom(Arc<KernelFn>),
}

impl Default for KernelTransform {
    fn default() -> Self {
        KernelTransform::Relu {
            epsilon: DEFAULT_KERNEL_EPSILON,
        }
    }
}

impl fmt::Debug for KernelTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelTransform::Relu { epsilon } => {
                f.debug_struct("Relu").field("epsilon", epsilon).finish()
            }
            KernelTransform::Elu { epsilon } => {
                f.debug_struct("Elu").field("epsilon", epsilon).finish()
            }
            KernelTransform::Shifted { epsilon } => {
                f.debug_struct("Shifted").field("epsilon", epsilon).finish()
            }
            KernelTransform::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl KernelTransform {
    /// Wraps a closure as a feature map.
    pub fn custom<F>(map: F) -> Self
    where
        F: Fn(&Tensor) -> candle_core::Result<Tensor> + Send + Sync + 'static,
    {
        KernelTransform::Custom(Arc::new(map))
    }

    /// The identity map plus the default floor.
    pub fn shifted_identity() -> Self {
        KernelTransform::Shifted {
            epsilon: DEFAULT_KERNEL_EPSILON,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KernelTransform::Relu { .. } => "relu",
            KernelTransform::Elu { .. } => "elu",
            KernelTransform::Shifted { .. } => "shifted",
            KernelTransform::Custom(_) => "custom",
        }
    }

    /// Applies `φ` elementwise. The result has the same shape as `x`.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor, AttentionError> {
        let features = match self {
            KernelTransform::Relu { epsilon } => x.relu()?.affine(1.0, *epsilon)?,
            KernelTransform::Elu { epsilon } => {
                let negative_part = x.neg()?.relu()?.neg()?.exp()?;
                (x.relu()? + negative_part)?.affine(1.0, *epsilon)?
            }
            KernelTransform::Shifted { epsilon } => x.affine(1.0, *epsilon)?,
            KernelTransform::Custom(map) => map(x)?,
        };
        if features.dims() != x.dims() {
            return Err(AttentionError::shape(format!(
                "kernel transform '{}' changed shape {:?} -> {:?}",
                self.name(),
                x.dims(),
                features.dims()
            )));
        }
        Ok(features)
    }
}
