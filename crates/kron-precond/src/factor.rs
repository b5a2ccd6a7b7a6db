//! Per-axis Kronecker factors and the axis contraction they are applied with.

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{PrecondError, PrecondResult};
use crate::linalg::{self, ScratchPool};
use crate::state::TensorState;

/// Contract axis `axis` of `x` with the square matrix `m`:
/// `out[.., j, ..] = Σ_a x[.., a, ..] · m[a, j]`.
///
/// The axis is swapped to the end, the tensor viewed as `(rows, n)` and
/// multiplied, then swapped back. No Kronecker product is ever formed.
pub fn contract_axis(x: &Tensor, axis: usize, m: &Tensor) -> candle_core::Result<Tensor> {
    let dims = x.dims().to_vec();
    let n = dims[axis];
    if x.elem_count() == 0 {
        return Ok(x.clone());
    }
    let last = dims.len() - 1;
    let moved = if axis == last {
        x.contiguous()?
    } else {
        x.transpose(axis, last)?.contiguous()?
    };
    let moved_dims = moved.dims().to_vec();
    let rows = moved.elem_count() / n;
    let out = moved.reshape((rows, n))?.matmul(m)?.reshape(moved_dims)?;
    if axis == last {
        Ok(out)
    } else {
        out.transpose(axis, last)?.contiguous()
    }
}

/// Multiply `x` elementwise by the vector `d` laid along `axis`.
pub fn scale_axis(x: &Tensor, axis: usize, d: &Tensor) -> candle_core::Result<Tensor> {
    let mut shape = vec![1usize; x.rank()];
    shape[axis] = d.elem_count();
    x.broadcast_mul(&d.reshape(shape)?)
}

/// Divide `x` elementwise by the vector `d` laid along `axis`.
pub fn unscale_axis(x: &Tensor, axis: usize, d: &Tensor) -> candle_core::Result<Tensor> {
    let mut shape = vec![1usize; x.rank()];
    shape[axis] = d.elem_count();
    x.broadcast_div(&d.reshape(shape)?)
}

/// Discriminant of [`Factor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    Identity,
    Full,
    Triangular,
    Diagonal,
}

/// One axis of a Kronecker-factored preconditioner.
#[derive(Debug, Clone)]
pub enum Factor {
    Identity,
    /// Orthonormal eigenbasis, columns are basis vectors.
    Full(Tensor),
    /// Upper-triangular PSGD factor.
    Triangular(Tensor),
    /// Diagonal PSGD factor stored as a vector.
    Diagonal(Tensor),
}

/// Serialized form of a [`Factor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorState {
    Identity,
    Full(TensorState),
    Triangular(TensorState),
    Diagonal(TensorState),
}

impl Factor {
    /// Fresh factor of `kind` for an axis of length `n`, scaled by `scale`.
    pub fn init(kind: FactorKind, n: usize, scale: f64, device: &Device) -> PrecondResult<Self> {
        let factor = match kind {
            FactorKind::Identity => Factor::Identity,
            FactorKind::Full => Factor::Full(Tensor::eye(n, candle_core::DType::F32, device)?),
            FactorKind::Triangular => Factor::Triangular(
                (Tensor::eye(n, candle_core::DType::F32, device)? * scale)?,
            ),
            FactorKind::Diagonal => Factor::Diagonal(
                (Tensor::ones(n, candle_core::DType::F32, device)? * scale)?,
            ),
        };
        Ok(factor)
    }

    pub fn kind(&self) -> FactorKind {
        match self {
            Factor::Identity => FactorKind::Identity,
            Factor::Full(_) => FactorKind::Full,
            Factor::Triangular(_) => FactorKind::Triangular,
            Factor::Diagonal(_) => FactorKind::Diagonal,
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Factor::Identity)
    }

    pub fn tensor(&self) -> Option<&Tensor> {
        match self {
            Factor::Identity => None,
            Factor::Full(t) | Factor::Triangular(t) | Factor::Diagonal(t) => Some(t),
        }
    }

    /// Axis length this factor acts on; `None` for identity.
    pub fn dim(&self) -> Option<usize> {
        self.tensor().map(|t| t.dims()[0])
    }

    /// `Fᵀ` along `axis` (`d ⊙ x` for diagonal factors).
    pub fn apply(&self, x: &Tensor, axis: usize) -> PrecondResult<Tensor> {
        let out = match self {
            Factor::Identity => x.clone(),
            Factor::Full(q) | Factor::Triangular(q) => contract_axis(x, axis, q)?,
            Factor::Diagonal(d) => scale_axis(x, axis, d)?,
        };
        Ok(out)
    }

    /// `F` along `axis`.
    pub fn mul(&self, x: &Tensor, axis: usize) -> PrecondResult<Tensor> {
        let out = match self {
            Factor::Identity => x.clone(),
            Factor::Full(q) | Factor::Triangular(q) => {
                contract_axis(x, axis, &q.t()?.contiguous()?)?
            }
            Factor::Diagonal(d) => scale_axis(x, axis, d)?,
        };
        Ok(out)
    }

    /// Exact inverse of [`Factor::apply`].
    pub fn apply_inverse(
        &self,
        x: &Tensor,
        axis: usize,
        pool: &mut ScratchPool,
    ) -> PrecondResult<Tensor> {
        self.try_apply_inverse(x, axis, pool)?.ok_or_else(|| {
            PrecondError::Tensor(format!("{:?} factor on axis {} is singular", self.kind(), axis))
        })
    }

    /// Like [`Factor::apply_inverse`], with `None` for a singular factor.
    pub fn try_apply_inverse(
        &self,
        x: &Tensor,
        axis: usize,
        pool: &mut ScratchPool,
    ) -> PrecondResult<Option<Tensor>> {
        let out = match self {
            Factor::Identity => x.clone(),
            // orthonormal: (Qᵀ)⁻¹ = Q
            Factor::Full(q) => contract_axis(x, axis, &q.t()?.contiguous()?)?,
            Factor::Triangular(q) => match triangular_inverse(q, pool)? {
                Some(inv) => contract_axis(x, axis, &inv)?,
                None => return Ok(None),
            },
            Factor::Diagonal(d) => {
                let values = d.to_vec1::<f32>()?;
                if values.iter().any(|v| *v == 0.0) {
                    return Ok(None);
                }
                unscale_axis(x, axis, d)?
            }
        };
        Ok(Some(out))
    }

    pub fn is_finite(&self) -> PrecondResult<bool> {
        match self.tensor() {
            None => Ok(true),
            Some(t) => {
                let values = t.flatten_all()?.to_vec1::<f32>()?;
                Ok(values.iter().all(|v| v.is_finite()))
            }
        }
    }

    pub fn to_state(&self) -> PrecondResult<FactorState> {
        let state = match self {
            Factor::Identity => FactorState::Identity,
            Factor::Full(t) => FactorState::Full(TensorState::from_tensor(t)?),
            Factor::Triangular(t) => FactorState::Triangular(TensorState::from_tensor(t)?),
            Factor::Diagonal(t) => FactorState::Diagonal(TensorState::from_tensor(t)?),
        };
        Ok(state)
    }

    pub fn from_state(state: &FactorState, device: &Device) -> PrecondResult<Self> {
        let factor = match state {
            FactorState::Identity => Factor::Identity,
            FactorState::Full(t) => Factor::Full(t.to_tensor(device)?),
            FactorState::Triangular(t) => Factor::Triangular(t.to_tensor(device)?),
            FactorState::Diagonal(t) => Factor::Diagonal(t.to_tensor(device)?),
        };
        Ok(factor)
    }
}

/// `F⁻¹` of an upper-triangular factor; `None` if singular.
pub fn triangular_inverse(q: &Tensor, pool: &mut ScratchPool) -> PrecondResult<Option<Tensor>> {
    let m = linalg::to_matrix(q, pool)?;
    let inv = linalg::upper_triangular_inverse(&m);
    pool.recycle(m);
    inv.map(|inv| linalg::from_matrix(inv, q.device(), pool))
        .transpose()
}
