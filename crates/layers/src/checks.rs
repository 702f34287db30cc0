//! Shape and dtype assertions shared by the layer constructors.
//!
//! Every helper takes a `label` naming the tensor being checked so errors point
//! at the offending parameter. They return `candle_core::Result<()>` so call
//! sites can propagate with `?` instead of panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Dtypes accepted for layer parameters and activations.
pub const FLOAT_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32];

/// Ensures a tensor has exactly `rank` dimensions.
pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank {rank}, got {:?}",
            tensor.dims()
        )))
    }
}

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {expected:?}, got {:?}",
            tensor.dims()
        )))
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(label: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [batch, seq, actual] if *actual == hidden && *batch > 0 && *seq > 0 => Ok(()),
        dims => Err(Error::Msg(format!(
            "{label}: expected (batch, seq, {hidden}) layout with non-zero batch/seq, got {dims:?}"
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Rejects strided views; parameters are stored densely.
pub fn expect_contiguous(label: &str, tensor: &Tensor) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        Err(Error::Msg(format!("{label}: tensor must be contiguous")))
    }
}

/// Convenience wrapper for parameters: shape, float dtype and contiguity.
pub fn expect_parameter(label: &str, tensor: &Tensor, shape: &[usize]) -> Result<()> {
    expect_shape(label, tensor, shape)?;
    expect_dtype_in(label, tensor, FLOAT_DTYPES)?;
    expect_contiguous(label, tensor)
}
