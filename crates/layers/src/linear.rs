//! Dense affine projections.
//!
//! Inputs are shaped `(batch, seq, in_dim)` or `(rows, in_dim)`; the output
//! replaces the last axis with `out_dim`. Weights are stored `(out_dim, in_dim)`
//! and applied as `x · Wᵀ (+ b)` in the policy's compute dtype, with the result
//! cast back to the storage dtype.

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{checks, dtypes::ComputePolicy};

/// Static description of a projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Produced feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector is added after the matmul.
    pub bias: bool,
}

impl LinearConfig {
    /// A biased projection from `input_dim` to `output_dim`.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    /// A bias-free projection, as used for the query/key/value maps.
    pub fn without_bias(input_dim: usize, output_dim: usize) -> Self {
        Self {
            bias: false,
            ..Self::new(input_dim, output_dim)
        }
    }
}

/// Weight initialisation policies.
#[derive(Debug, Clone, PartialEq)]
pub enum LinearInit {
    /// Draws every entry from `N(0, std²)`.
    Normal { std: f64 },
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Xavier/Glorot normal initialisation.
    XavierNormal,
}

impl LinearInit {
    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let weight = match self {
            LinearInit::Normal { std } => Tensor::randn(0f32, *std as f32, shape, device)?,
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt() as f32;
                Tensor::rand(-bound, bound, shape, device)?
            }
            LinearInit::XavierNormal => {
                let std = (2.0f64 / (fan_in + fan_out)).sqrt() as f32;
                Tensor::randn(0f32, std, shape, device)?
            }
        };
        weight.to_dtype(dtype)
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a layer from existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a layer with weights drawn from `init` and a zero bias.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.output_dim, config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Replaces the weight, keeping the current dtype.
    pub fn set_weight(&mut self, value: &Tensor) -> Result<()> {
        let cast = value.to_dtype(self.weight.dtype())?.contiguous()?;
        Self::validate_weight(&self.config, &cast)?;
        self.weight = cast;
        Ok(())
    }

    /// Replaces the bias, keeping the current dtype.
    pub fn set_bias(&mut self, value: &Tensor) -> Result<()> {
        let existing = self
            .bias
            .as_ref()
            .ok_or_else(|| Error::Msg("layer has no bias to replace".into()))?;
        let cast = value.to_dtype(existing.dtype())?.contiguous()?;
        Self::validate_bias(&self.config, Some(&cast))?;
        self.bias = Some(cast);
        Ok(())
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_parameter(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_parameter("linear.bias", tensor, &[config.output_dim])
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    /// Applies `x · Wᵀ (+ b)` over the last axis.
    pub fn forward(&self, hidden: &Tensor, policy: &ComputePolicy) -> Result<Tensor> {
        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(&self.weight)?.t()?;

        let mut output = match input.dims() {
            [batch, seq, hidden_dim] if *hidden_dim == self.config.input_dim => {
                let flat = input.reshape((*batch * *seq, *hidden_dim))?;
                flat.matmul(&weight_t)?
                    .reshape((*batch, *seq, self.config.output_dim))?
            }
            [_, hidden_dim] if *hidden_dim == self.config.input_dim => input.matmul(&weight_t)?,
            dims => {
                return Err(Error::Msg(format!(
                    "linear expects input shaped [B, T, {in_dim}] or [T, {in_dim}], got {dims:?}",
                    in_dim = self.config.input_dim
                )))
            }
        };

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_matmul(bias)?)?;
        }

        policy.cast_to_storage(&output)
    }
}
