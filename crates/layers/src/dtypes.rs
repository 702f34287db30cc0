//! Dtype policy used by the projection and normalisation layers.
//!
//! Parameters may be stored in `f16`/`bf16`, but matmuls run in the compute
//! dtype and layer-norm statistics are always gathered in `f32`. Outputs are
//! cast back to the storage dtype so a block's output matches its input.

use candle_core::{DType, Result, Tensor};

/// Describes how tensors are cast while a layer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputePolicy {
    storage: DType,
    compute: DType,
}

impl ComputePolicy {
    /// Builds a policy from the parameter storage dtype, promoting half
    /// precision to `f32` for compute.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self { storage, compute }
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Statistics are accumulated in `f32` or wider.
    pub fn reduction(&self) -> DType {
        match self.compute {
            DType::F64 => DType::F64,
            _ => DType::F32,
        }
    }

    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction())
    }

    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }

    /// Comparison tolerance appropriate for values held in the storage dtype.
    pub fn storage_tolerance(&self) -> f32 {
        match self.storage {
            DType::BF16 => 2e-2,
            DType::F16 => 5e-3,
            DType::F64 => 1e-7,
            _ => 1e-5,
        }
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
