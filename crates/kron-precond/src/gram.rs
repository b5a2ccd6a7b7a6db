//! Per-axis Gram statistics.

use candle_core::Tensor;

use crate::error::{PrecondError, PrecondResult};

/// How a fresh outer product enters the running Gram matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GramBlend {
    /// Replace: `G = outer`.
    Exact,
    /// `G = β·G + (1-β)·outer`.
    Ema(f64),
}

/// Outer product of `g` with itself over every axis except `axis`.
pub fn axis_outer(g: &Tensor, axis: usize) -> candle_core::Result<Tensor> {
    let n = g.dims()[axis];
    let moved = if axis == 0 {
        g.contiguous()?
    } else {
        g.transpose(0, axis)?.contiguous()?
    };
    let flat = moved.reshape((n, g.elem_count() / n.max(1)))?;
    flat.matmul(&flat.t()?)
}

/// Sum of squares of `g` over every axis except `axis`, i.e. the diagonal
/// of [`axis_outer`].
pub fn axis_sumsq(g: &Tensor, axis: usize) -> candle_core::Result<Tensor> {
    let n = g.dims()[axis];
    let moved = if axis == 0 {
        g.contiguous()?
    } else {
        g.transpose(0, axis)?.contiguous()?
    };
    moved
        .reshape((n, g.elem_count() / n.max(1)))?
        .sqr()?
        .sum(1)
}

/// `(A + Aᵀ) / 2`
pub fn symmetrize(a: &Tensor) -> candle_core::Result<Tensor> {
    ((a + a.t()?)? * 0.5)?.contiguous()
}

/// Blend the outer products of `merged_grad` into every populated slot.
///
/// Slots holding `None` (axes without a full factor) are left alone.
pub fn update_grams(
    grams: &mut [Option<Tensor>],
    merged_grad: &Tensor,
    blend: GramBlend,
) -> PrecondResult<()> {
    if grams.len() != merged_grad.rank() {
        return Err(PrecondError::Tensor(format!(
            "{} Gram slots for a rank-{} gradient",
            grams.len(),
            merged_grad.rank()
        )));
    }
    for (axis, slot) in grams.iter_mut().enumerate() {
        let Some(current) = slot.as_ref() else {
            continue;
        };
        let outer = axis_outer(merged_grad, axis)?;
        let blended = match blend {
            GramBlend::Exact => outer,
            GramBlend::Ema(beta) => ((current * beta)? + (outer * (1.0 - beta))?)?,
        };
        *slot = Some(symmetrize(&blended)?);
    }
    Ok(())
}

/// Largest `|A - Aᵀ|` entry.
pub fn asymmetry(a: &Tensor) -> candle_core::Result<f32> {
    (a - a.t()?)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}
