use std::fmt;

use attention::{
    Attention, AttentionKernel, AttentionPath, CausalMask, DecodeState, KernelTransform,
};
use candle_core::{DType, Device, Tensor};
use layers::{
    checks, ComputePolicy, LayerNorm, Linear, LinearConfig, LinearInit, NormConfig,
};

use crate::config::BlockConfig;
use crate::error::ModelError;

/// Stable order of [`MultiHeadAttentionBlock::parameters`].
pub const PARAMETER_NAMES: [&str; 7] = [
    "wq",
    "wk",
    "wv",
    "out_proj.weight",
    "out_proj.bias",
    "norm.weight",
    "norm.bias",
];

/// Explicit parameters for a block.
///
/// Projection matrices use the `(out, in)` layout of [`Linear`], so every
/// matrix is `(embed_dim, embed_dim)` and vectors are `(embed_dim,)`.
#[derive(Debug, Clone)]
pub struct BlockWeights {
    pub wq: Tensor,
    pub wk: Tensor,
    pub wv: Tensor,
    pub out_weight: Tensor,
    pub out_bias: Tensor,
    pub norm_weight: Tensor,
    pub norm_bias: Tensor,
}

impl BlockWeights {
    /// Identity projections, zero output bias, unit LayerNorm.
    pub fn identity(embed_dim: usize, dtype: DType, device: &Device) -> candle_core::Result<Self> {
        let eye = Tensor::eye(embed_dim, dtype, device)?;
        Ok(Self {
            wq: eye.clone(),
            wk: eye.clone(),
            wv: eye.clone(),
            out_weight: eye,
            out_bias: Tensor::zeros(embed_dim, dtype, device)?,
            norm_weight: Tensor::ones(embed_dim, dtype, device)?,
            norm_bias: Tensor::zeros(embed_dim, dtype, device)?,
        })
    }
}

/// Multi-head kernelised attention block.
///
/// Pipeline per call: project q/k/v, LayerNorm each with the shared
/// parameters, split heads, map q/k through the kernel, attend on the
/// configured path, merge heads, project out and LayerNorm the result.
pub struct MultiHeadAttentionBlock {
    config: BlockConfig,
    head_dim: usize,
    policy: ComputePolicy,
    wq: Linear,
    wk: Linear,
    wv: Linear,
    out_proj: Linear,
    norm: LayerNorm,
    kernel: KernelTransform,
    attention: AttentionKernel,
}

impl fmt::Debug for MultiHeadAttentionBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiHeadAttentionBlock")
            .field("embed_dim", &self.config.embed_dim)
            .field("num_heads", &self.config.num_heads)
            .field("head_dim", &self.head_dim)
            .field("path", &self.attention.path())
            .field("kernel", &self.kernel)
            .finish()
    }
}

impl MultiHeadAttentionBlock {
    /// Builds a block from explicit weights, cast to `config.dtype`.
    ///
    /// `kernel` defaults to [`KernelTransform::default`] (ReLU + ε).
    pub fn new(
        config: BlockConfig,
        weights: BlockWeights,
        kernel: Option<KernelTransform>,
    ) -> Result<Self, ModelError> {
        config.validate()?;
        let embed = config.embed_dim;
        let cast = |t: Tensor| -> candle_core::Result<Tensor> {
            t.to_dtype(config.dtype)?.to_device(&config.device)
        };

        let projection = |t: Tensor| -> Result<Linear, ModelError> {
            Ok(Linear::new(LinearConfig::without_bias(embed, embed), cast(t)?, None)?)
        };
        let wq = projection(weights.wq)?;
        let wk = projection(weights.wk)?;
        let wv = projection(weights.wv)?;
        let out_proj = Linear::new(
            LinearConfig::new(embed, embed),
            cast(weights.out_weight)?,
            Some(cast(weights.out_bias)?),
        )?;
        let norm = LayerNorm::new(
            cast(weights.norm_weight)?,
            cast(weights.norm_bias)?,
            Self::norm_config(&config),
        )?;

        Ok(Self::assemble(config, wq, wk, wv, out_proj, norm, kernel))
    }

    /// Builds a block with projections drawn from `init` and an identity LayerNorm.
    pub fn with_init(
        config: BlockConfig,
        init: &LinearInit,
        kernel: Option<KernelTransform>,
    ) -> Result<Self, ModelError> {
        config.validate()?;
        let embed = config.embed_dim;
        let (device, dtype) = (&config.device, config.dtype);

        let wq = Linear::with_init(LinearConfig::without_bias(embed, embed), init, device, dtype)?;
        let wk = Linear::with_init(LinearConfig::without_bias(embed, embed), init, device, dtype)?;
        let wv = Linear::with_init(LinearConfig::without_bias(embed, embed), init, device, dtype)?;
        let out_proj = Linear::with_init(LinearConfig::new(embed, embed), init, device, dtype)?;
        let norm = LayerNorm::identity(Self::norm_config(&config), device, dtype)?;

        Ok(Self::assemble(config, wq, wk, wv, out_proj, norm, kernel))
    }

    fn norm_config(config: &BlockConfig) -> NormConfig {
        NormConfig {
            hidden_size: config.embed_dim,
            epsilon: config.layer_norm_epsilon,
        }
    }

    fn assemble(
        config: BlockConfig,
        wq: Linear,
        wk: Linear,
        wv: Linear,
        out_proj: Linear,
        norm: LayerNorm,
        kernel: Option<KernelTransform>,
    ) -> Self {
        let kernel = kernel.unwrap_or_default();
        let attention = AttentionKernel::for_path(config.attention.path);
        log::debug!(
            "attention block: embed_dim={} heads={} path={} kernel={} dtype={:?}",
            config.embed_dim,
            config.num_heads,
            config.attention.path,
            kernel.name(),
            config.dtype
        );
        Self {
            head_dim: config.head_dim(),
            policy: ComputePolicy::from_parameter_dtype(config.dtype),
            config,
            wq,
            wk,
            wv,
            out_proj,
            norm,
            kernel,
            attention,
        }
    }

    pub fn config(&self) -> &BlockConfig {
        &self.config
    }

    pub fn embed_dim(&self) -> usize {
        self.config.embed_dim
    }

    pub fn num_heads(&self) -> usize {
        self.config.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn path(&self) -> AttentionPath {
        self.attention.path()
    }

    pub fn kernel(&self) -> &KernelTransform {
        &self.kernel
    }

    /// Runs attention over `(batch, seq_len, embed_dim)` queries, keys and values.
    pub fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor, ModelError> {
        let (q_prime, k_prime, v_heads) = self.features(q, k, v)?;

        let mask = if self.attention.needs_materialized_mask() {
            Some(CausalMask::build(q.device(), q_prime.dim(2)?)?)
        } else {
            None
        };
        let attended = self.attention.attend(
            &q_prime,
            &k_prime,
            &v_heads,
            mask.as_ref(),
            &self.config.attention,
        )?;
        self.finish(&attended, q.dtype())
    }

    /// Zeroed running sums sized for this block.
    pub fn new_decode_state(&self, batch: usize) -> DecodeState {
        DecodeState::new(batch, self.config.num_heads, self.head_dim, self.head_dim)
    }

    /// Processes the next chunk of positions (usually one) against `state`.
    ///
    /// Feeding a sequence position by position yields the rows of a causal
    /// [`forward`](Self::forward) over the whole sequence.
    pub fn decode_step(
        &self,
        state: &mut DecodeState,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
    ) -> Result<Tensor, ModelError> {
        let path = self.attention.path();
        if !path.is_causal() {
            return Err(ModelError::InvalidInput(format!(
                "decode_step requires a causal attention path, block uses {path}"
            )));
        }
        let (q_prime, k_prime, v_heads) = self.features(q, k, v)?;
        let attended = state.step(&q_prime, &k_prime, &v_heads, &self.config.attention)?;
        self.finish(&attended, q.dtype())
    }

    /// Named parameters in [`PARAMETER_NAMES`] order.
    pub fn parameters(&self) -> Vec<(&'static str, &Tensor)> {
        // out_proj is always built with a bias.
        let out_bias = self
            .out_proj
            .bias()
            .unwrap_or_else(|| self.out_proj.weight());
        vec![
            (PARAMETER_NAMES[0], self.wq.weight()),
            (PARAMETER_NAMES[1], self.wk.weight()),
            (PARAMETER_NAMES[2], self.wv.weight()),
            (PARAMETER_NAMES[3], self.out_proj.weight()),
            (PARAMETER_NAMES[4], out_bias),
            (PARAMETER_NAMES[5], self.norm.weight()),
            (PARAMETER_NAMES[6], self.norm.bias()),
        ]
    }

    /// Replaces every parameter with `f(name, current)`.
    ///
    /// All replacements are produced and shape-checked before any is stored,
    /// so a failure leaves the block unchanged.
    pub fn update_parameters<F>(&mut self, mut f: F) -> Result<(), ModelError>
    where
        F: FnMut(&str, &Tensor) -> candle_core::Result<Tensor>,
    {
        let mut replacements = Vec::with_capacity(PARAMETER_NAMES.len());
        for (name, current) in self.parameters() {
            let next = f(name, current)?;
            if next.dims() != current.dims() {
                return Err(ModelError::ParameterShape {
                    name,
                    expected: current.dims().to_vec(),
                    actual: next.dims().to_vec(),
                });
            }
            replacements.push(next);
        }

        let [wq, wk, wv, out_w, out_b, norm_w, norm_b]: [Tensor; 7] = replacements
            .try_into()
            .map_err(|_| ModelError::InvalidInput("parameter count changed".into()))?;
        self.wq.set_weight(&wq)?;
        self.wk.set_weight(&wk)?;
        self.wv.set_weight(&wv)?;
        self.out_proj.set_weight(&out_w)?;
        self.out_proj.set_bias(&out_b)?;
        self.norm.set_weight(&norm_w)?;
        self.norm.set_bias(&norm_b)?;
        Ok(())
    }

    fn check_inputs(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<(), ModelError> {
        checks::expect_batch_seq_hidden("block.q", q, self.config.embed_dim)?;
        if k.dims() != q.dims() || v.dims() != q.dims() {
            return Err(ModelError::InvalidInput(format!(
                "q, k and v must share a shape, got q {:?} k {:?} v {:?}",
                q.dims(),
                k.dims(),
                v.dims()
            )));
        }
        if !k.device().same_device(q.device()) || !v.device().same_device(q.device()) {
            return Err(ModelError::InvalidInput(
                "q, k and v must live on the same device".into(),
            ));
        }
        Ok(())
    }

    /// Projection, shared LayerNorm, head split and kernel map.
    fn features(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor), ModelError> {
        self.check_inputs(q, k, v)?;
        let project = |linear: &Linear, x: &Tensor| -> Result<Tensor, ModelError> {
            let x = x.to_dtype(self.config.dtype)?;
            let projected = linear.forward(&x, &self.policy)?;
            let normed = self.norm.forward(&projected, &self.policy)?;
            self.split_heads(&normed)
        };
        let q_heads = project(&self.wq, q)?;
        let k_heads = project(&self.wk, k)?;
        let v_heads = project(&self.wv, v)?;

        let q_prime = self.kernel.apply(&q_heads)?;
        let k_prime = self.kernel.apply(&k_heads)?;
        Ok((q_prime, k_prime, v_heads))
    }

    fn finish(&self, attended: &Tensor, output_dtype: DType) -> Result<Tensor, ModelError> {
        let merged = self.merge_heads(attended)?;
        let projected = self.out_proj.forward(&merged, &self.policy)?;
        let normed = self.norm.forward(&projected, &self.policy)?;
        Ok(normed.to_dtype(output_dtype)?)
    }

    fn split_heads(&self, tensor: &Tensor) -> Result<Tensor, ModelError> {
        let (batch, seq, _) = tensor.dims3()?;
        let heads = tensor
            .reshape((batch, seq, self.config.num_heads, self.head_dim))?
            .permute((0, 2, 1, 3))?
            .contiguous()?;
        Ok(heads)
    }

    fn merge_heads(&self, tensor: &Tensor) -> Result<Tensor, ModelError> {
        let (batch, heads, seq, head_dim) = tensor.dims4()?;
        if heads * head_dim != self.config.embed_dim {
            return Err(ModelError::InvalidInput(format!(
                "cannot merge {heads} heads of width {head_dim} into embed_dim {}",
                self.config.embed_dim
            )));
        }
        let merged = tensor
            .permute((0, 2, 1, 3))?
            .contiguous()?
            .reshape((batch, seq, self.config.embed_dim))?;
        Ok(merged)
    }
}
