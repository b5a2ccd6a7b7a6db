//! Projection of tensors into and out of a Kronecker-factored basis.
//!
//! Each factor acts on its own merged axis, one contraction at a time.
//! `project(project(x, Forward), Inverse) == x` holds as long as the
//! factors are not refreshed between the two calls.

use candle_core::Tensor;

use crate::error::{PrecondError, PrecondResult};
use crate::factor::Factor;
use crate::linalg::ScratchPool;
use crate::merge::MergedLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `Fᵀ` along every axis.
    Forward,
    /// The inverse of `Forward`.
    Inverse,
}

fn check_rank(x: &Tensor, factors: &[Factor]) -> PrecondResult<()> {
    if x.rank() != factors.len() {
        return Err(PrecondError::Tensor(format!(
            "cannot project rank-{} tensor with {} factors",
            x.rank(),
            factors.len()
        )));
    }
    Ok(())
}

/// Project a tensor that is already in merged shape.
pub fn project_merged(
    x: &Tensor,
    factors: &[Factor],
    direction: Direction,
    pool: &mut ScratchPool,
) -> PrecondResult<Tensor> {
    check_rank(x, factors)?;
    let mut out = x.clone();
    for (axis, factor) in factors.iter().enumerate() {
        out = match direction {
            Direction::Forward => factor.apply(&out, axis)?,
            Direction::Inverse => factor.apply_inverse(&out, axis, pool)?,
        };
    }
    Ok(out)
}

/// Project a tensor of the parameter's original shape.
pub fn project(
    x: &Tensor,
    factors: &[Factor],
    layout: &MergedLayout,
    direction: Direction,
    pool: &mut ScratchPool,
) -> PrecondResult<Tensor> {
    let merged = layout.merge(x)?;
    let projected = project_merged(&merged, factors, direction, pool)?;
    layout.unmerge(&projected)
}

/// Apply `FᵀF` along every axis of a merged tensor.
pub fn precondition_merged(x: &Tensor, factors: &[Factor]) -> PrecondResult<Tensor> {
    check_rank(x, factors)?;
    let mut out = x.clone();
    for (axis, factor) in factors.iter().enumerate() {
        out = factor.apply(&factor.mul(&out, axis)?, axis)?;
    }
    Ok(out)
}

pub fn precondition(x: &Tensor, factors: &[Factor], layout: &MergedLayout) -> PrecondResult<Tensor> {
    let merged = layout.merge(x)?;
    layout.unmerge(&precondition_merged(&merged, factors)?)
}
