#![allow(dead_code)]

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{BlockConfig, MultiHeadAttentionBlock};

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let diff = a
        .to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?;
    Ok(diff)
}

pub fn random_hidden(batch: usize, seq: usize, embed: usize) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 1.0, (batch, seq, embed), &Device::Cpu)?)
}

/// Xavier-initialised block on the CPU.
pub fn random_block(config: BlockConfig) -> Result<MultiHeadAttentionBlock> {
    Ok(MultiHeadAttentionBlock::with_init(
        config,
        &layers::LinearInit::XavierUniform,
        None,
    )?)
}

/// Copy of `hidden` with sequence position `index` replaced by `value`.
pub fn overwrite_token(hidden: &Tensor, index: usize, value: &[f32]) -> Result<Tensor> {
    let (batch, seq, embed) = hidden.dims3()?;
    let token = Tensor::from_slice(value, (1, 1, embed), hidden.device())?
        .broadcast_as((batch, 1, embed))?
        .contiguous()?;
    let mut pieces = Vec::new();
    if index > 0 {
        pieces.push(hidden.narrow(1, 0, index)?);
    }
    pieces.push(token);
    if index + 1 < seq {
        pieces.push(hidden.narrow(1, index + 1, seq - index - 1)?);
    }
    Ok(Tensor::cat(&pieces, 1)?)
}
