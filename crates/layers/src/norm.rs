//! Layer normalisation over the hidden axis.
//!
//! Inputs follow the `(batch, seq, hidden)` convention. Mean and variance are
//! gathered in [`ComputePolicy::reduction`] before the affine scale and shift
//! are applied and the result is cast back to the storage dtype.

use candle_core::{DType, Device, Result, Tensor, D};

use crate::{checks, dtypes::ComputePolicy};

/// Default variance stabiliser for attention-block normalisation.
pub const DEFAULT_LAYER_NORM_EPSILON: f64 = 1e-6;

/// Configuration for [`LayerNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Added to the variance before the square root.
    pub epsilon: f64,
}

impl NormConfig {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: DEFAULT_LAYER_NORM_EPSILON,
        }
    }
}

/// LayerNorm with learnable scale (`gamma`) and shift (`beta`).
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    /// Constructs a LayerNorm from explicit scale and shift parameters.
    pub fn new(weight: Tensor, bias: Tensor, config: NormConfig) -> Result<Self> {
        checks::expect_parameter("norm.weight", &weight, &[config.hidden_size])?;
        checks::expect_parameter("norm.bias", &bias, &[config.hidden_size])?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Unit scale and zero shift.
    pub fn identity(config: NormConfig, device: &Device, dtype: DType) -> Result<Self> {
        let weight = Tensor::ones(config.hidden_size, dtype, device)?;
        let bias = Tensor::zeros(config.hidden_size, dtype, device)?;
        Self::new(weight, bias, config)
    }

    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// Replaces the scale, keeping the current dtype.
    pub fn set_weight(&mut self, value: &Tensor) -> Result<()> {
        let cast = value.to_dtype(self.weight.dtype())?.contiguous()?;
        checks::expect_parameter("norm.weight", &cast, &[self.config.hidden_size])?;
        self.weight = cast;
        Ok(())
    }

    /// Replaces the shift, keeping the current dtype.
    pub fn set_bias(&mut self, value: &Tensor) -> Result<()> {
        let cast = value.to_dtype(self.bias.dtype())?.contiguous()?;
        checks::expect_parameter("norm.bias", &cast, &[self.config.hidden_size])?;
        self.bias = cast;
        Ok(())
    }

    pub fn forward(&self, hidden: &Tensor, policy: &ComputePolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let compute = policy.cast_for_reduction(hidden)?;
        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let normalized = centered.broadcast_div(&denom)?;

        let weight = self.weight.to_dtype(normalized.dtype())?;
        let bias = self.bias.to_dtype(normalized.dtype())?;
        let out = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;

        policy.cast_to_storage(&out)
    }
}
