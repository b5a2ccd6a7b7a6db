//! SOAP eigenbases.
//!
//! The first basis comes from a full symmetric eigendecomposition. Later
//! refreshes take one power-iteration step seeded with the previous basis
//! and re-orthogonalize it with QR, which keeps columns (and their signs)
//! aligned with the ones the running second moment was accumulated in.

use candle_core::{DType, Tensor};
use nalgebra::DMatrix;
use tracing::{debug, warn};

use crate::config::MemorySaveMode;
use crate::error::PrecondResult;
use crate::factor::{Factor, FactorKind};
use crate::linalg::{self, ScratchPool};
use crate::merge::MergedLayout;
use crate::state::{ParamId, ParameterState};

use super::diagonal_axes;

/// Which merged axes get a full eigenbasis.
pub fn soap_factor_kinds(
    layout: &MergedLayout,
    max_precond_dim: usize,
    precondition_1d: bool,
    memory_save_mode: Option<MemorySaveMode>,
) -> Vec<FactorKind> {
    let dims = layout.merged();
    if dims.len() == 1 {
        let n = dims[0];
        let full = precondition_1d && n > 1 && n <= max_precond_dim;
        return vec![if full {
            FactorKind::Full
        } else {
            FactorKind::Identity
        }];
    }

    let diag = diagonal_axes(dims, memory_save_mode);
    dims.iter()
        .zip(diag)
        .map(|(&n, forced)| {
            if n == 1 || n > max_precond_dim || forced {
                FactorKind::Identity
            } else {
                FactorKind::Full
            }
        })
        .collect()
}

/// Eigenbasis of `gram`, columns by descending eigenvalue.
///
/// Returns `None` when the decomposition fails; callers fall back to the
/// identity. An all-zero Gram matrix yields the identity directly.
pub fn initial_eigenbasis(gram: &Tensor, pool: &mut ScratchPool) -> PrecondResult<Option<Tensor>> {
    let n = gram.dims()[0];
    let m = linalg::to_matrix(gram, pool)?;
    if linalg::max_abs(&m) == 0.0 {
        pool.recycle(m);
        return Ok(Some(Tensor::eye(n, DType::F32, gram.device())?));
    }
    match linalg::sorted_eigenvectors(m) {
        Some((_, vectors)) => Ok(Some(linalg::from_matrix(vectors, gram.device(), pool)?)),
        None => Ok(None),
    }
}

/// Result of refreshing one axis.
#[derive(Debug, Clone)]
pub enum BasisRefresh {
    /// New basis; `order[j]` is the old column that became column `j`.
    Updated { basis: Tensor, order: Vec<usize> },
    /// Zero statistics: nothing to learn, the old basis stands.
    Unchanged,
    /// Non-finite or collapsed iterate: the old basis stands.
    Degenerate,
}

/// One QR power step from `basis` toward the eigenvectors of `gram`.
pub fn refresh_eigenbasis(
    gram: &Tensor,
    basis: &Tensor,
    pool: &mut ScratchPool,
) -> PrecondResult<BasisRefresh> {
    let g = linalg::to_matrix(gram, pool)?;
    if !linalg::is_finite(&g) {
        pool.recycle(g);
        return Ok(BasisRefresh::Degenerate);
    }
    if linalg::max_abs(&g) == 0.0 {
        pool.recycle(g);
        return Ok(BasisRefresh::Unchanged);
    }

    let q = linalg::to_matrix(basis, pool)?;
    let t = &g * &q;
    let estimates: Vec<f64> = (0..q.ncols())
        .map(|j| q.column(j).dot(&t.column(j)))
        .collect();
    pool.recycle(g);
    pool.recycle(q);

    if !linalg::is_finite(&t) || linalg::max_abs(&t) == 0.0 {
        return Ok(BasisRefresh::Degenerate);
    }

    let order = linalg::descending_order(&estimates);
    let n = t.nrows();
    let sorted = DMatrix::from_fn(n, n, |r, c| t[(r, order[c])]);
    let refreshed = linalg::qr_signed(sorted);
    if !linalg::is_finite(&refreshed) {
        return Ok(BasisRefresh::Degenerate);
    }

    Ok(BasisRefresh::Updated {
        basis: linalg::from_matrix(refreshed, basis.device(), pool)?,
        order,
    })
}

/// Build every full factor of a freshly created state from its Gram slots.
pub(crate) fn init_bases(
    id: ParamId,
    state: &mut ParameterState,
    pool: &mut ScratchPool,
) -> PrecondResult<()> {
    for axis in 0..state.factors.len() {
        let Some(gram) = state.grams[axis].as_ref() else {
            continue;
        };
        match initial_eigenbasis(gram, pool)? {
            Some(basis) => state.factors[axis] = Factor::Full(basis),
            None => {
                state.stats.skipped += 1;
                warn!(param = %id, axis, "eigendecomposition failed, starting from identity basis");
            }
        }
    }
    state.last_refresh_step = Some(state.step);
    debug!(param = %id, merged_shape = ?state.layout.merged(), "initialized eigenbases");
    Ok(())
}

/// Refresh every full factor of `state`, permuting the second moment to
/// follow reordered columns.
pub(crate) fn refresh_bases(
    id: ParamId,
    state: &mut ParameterState,
    pool: &mut ScratchPool,
) -> PrecondResult<()> {
    let mut degenerate_axes = Vec::new();

    for axis in 0..state.factors.len() {
        let (Some(gram), Factor::Full(basis)) = (state.grams[axis].as_ref(), &state.factors[axis])
        else {
            continue;
        };
        match refresh_eigenbasis(gram, basis, pool)? {
            BasisRefresh::Updated { basis, order } => {
                let index = Tensor::from_vec(
                    order.iter().map(|&i| i as u32).collect::<Vec<_>>(),
                    order.len(),
                    basis.device(),
                )?;
                state.exp_avg_sq = state.exp_avg_sq.index_select(&index, axis)?;
                state.factors[axis] = Factor::Full(basis);
            }
            BasisRefresh::Unchanged => {}
            BasisRefresh::Degenerate => degenerate_axes.push(axis),
        }
    }

    if degenerate_axes.is_empty() {
        state.stats.refreshes += 1;
        state.last_refresh_step = Some(state.step);
        debug!(param = %id, step = state.step, "refreshed eigenbases");
    } else {
        state.stats.skipped += 1;
        warn!(
            param = %id,
            step = state.step,
            axes = ?degenerate_axes,
            skipped_total = state.stats.skipped,
            "degenerate Gram statistics, keeping previous basis"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gram::axis_outer;
    use candle_core::{Device, Result};

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
    }

    #[test]
    fn test_factor_kinds() {
        let layout = MergedLayout::new(&[8, 8], 64, false);
        assert_eq!(
            soap_factor_kinds(&layout, 8, false, None),
            vec![FactorKind::Full, FactorKind::Full]
        );
        assert_eq!(
            soap_factor_kinds(&layout, 7, false, None),
            vec![FactorKind::Identity, FactorKind::Identity]
        );
        assert_eq!(
            soap_factor_kinds(&layout, 8, false, Some(MemorySaveMode::OneDiag)),
            vec![FactorKind::Full, FactorKind::Identity]
        );

        let vector = MergedLayout::new(&[16], 64, true);
        assert_eq!(
            soap_factor_kinds(&vector, 64, false, None),
            vec![FactorKind::Identity]
        );
        assert_eq!(
            soap_factor_kinds(&vector, 64, true, None),
            vec![FactorKind::Full]
        );
        assert_eq!(
            soap_factor_kinds(&vector, 15, true, None),
            vec![FactorKind::Identity]
        );
    }

    #[test]
    fn test_zero_gram_gives_identity() -> Result<()> {
        let device = Device::Cpu;
        let mut pool = ScratchPool::default();
        let gram = Tensor::zeros((4, 4), DType::F32, &device)?;
        let basis = initial_eigenbasis(&gram, &mut pool).unwrap().unwrap();
        assert!(max_diff(&basis, &Tensor::eye(4, DType::F32, &device)?)? == 0.0);
        assert!(matches!(
            refresh_eigenbasis(&gram, &basis, &mut pool).unwrap(),
            BasisRefresh::Unchanged
        ));
        Ok(())
    }

    #[test]
    fn test_initial_basis_diagonalizes_gram() -> Result<()> {
        let device = Device::Cpu;
        let mut pool = ScratchPool::default();
        let g = Tensor::new(&[[3f32, 1.0, 0.0], [1.0, 2.0, 0.5], [0.0, 0.5, 1.0]], &device)?;
        let gram = axis_outer(&g, 0)?;
        let q = initial_eigenbasis(&gram, &mut pool).unwrap().unwrap();
        let d = q.t()?.matmul(&gram)?.matmul(&q)?.to_vec2::<f32>()?;
        assert!(d[0][1].abs() < 1e-3 && d[1][2].abs() < 1e-3);
        assert!(d[0][0] >= d[1][1] && d[1][1] >= d[2][2]);
        Ok(())
    }

    #[test]
    fn test_refresh_keeps_converged_basis() -> Result<()> {
        let device = Device::Cpu;
        let mut pool = ScratchPool::default();
        let gram = Tensor::new(&[[4f32, 0.0], [0.0, 1.0]], &device)?;
        let q = Tensor::eye(2, DType::F32, &device)?;
        match refresh_eigenbasis(&gram, &q, &mut pool).unwrap() {
            BasisRefresh::Updated { basis, order } => {
                assert_eq!(order, vec![0, 1]);
                assert!(max_diff(&basis, &q)? < 1e-6);
            }
            other => panic!("expected update, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_refresh_reorders_columns() -> Result<()> {
        let device = Device::Cpu;
        let mut pool = ScratchPool::default();
        // the second basis vector now carries the larger eigenvalue
        let gram = Tensor::new(&[[1f32, 0.0], [0.0, 9.0]], &device)?;
        let q = Tensor::eye(2, DType::F32, &device)?;
        match refresh_eigenbasis(&gram, &q, &mut pool).unwrap() {
            BasisRefresh::Updated { basis, order } => {
                assert_eq!(order, vec![1, 0]);
                let b = basis.to_vec2::<f32>()?;
                assert!((b[1][0] - 1.0).abs() < 1e-6);
                assert!((b[0][1] - 1.0).abs() < 1e-6);
            }
            other => panic!("expected update, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_non_finite_gram_is_degenerate() -> Result<()> {
        let device = Device::Cpu;
        let mut pool = ScratchPool::default();
        let gram = Tensor::new(&[[f32::NAN, 0.0], [0.0, 1.0]], &device)?;
        let q = Tensor::eye(2, DType::F32, &device)?;
        assert!(matches!(
            refresh_eigenbasis(&gram, &q, &mut pool).unwrap(),
            BasisRefresh::Degenerate
        ));
        assert!(initial_eigenbasis(&gram, &mut pool).unwrap().is_none());
        Ok(())
    }
}
