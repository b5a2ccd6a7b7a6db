//! PSGD whitening factors.
//!
//! Each axis carries an upper-triangular (or diagonal) factor `Q` fitted so
//! that `QᵀQ` whitens the gradient. A refresh takes one normalized gradient
//! step on that fit, using a Gaussian probe for the inverse side.

use candle_core::{Device, Tensor};
use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::config::PsgdConfig;
use crate::error::PrecondResult;
use crate::factor::{Factor, FactorKind};
use crate::gram::{axis_outer, axis_sumsq};
use crate::linalg::{self, ScratchPool};
use crate::merge::MergedLayout;

use super::diagonal_axes;

/// Smallest normalizer a factor step divides by.
const TINY: f64 = f32::MIN_POSITIVE as f64;

/// Triangular or diagonal, per merged axis.
pub fn psgd_factor_kinds(dims: &[usize], config: &PsgdConfig) -> Vec<FactorKind> {
    let diag = diagonal_axes(dims, config.memory_save_mode);
    let too_few_axes = dims.len() < config.min_ndim_triangular;
    dims.iter()
        .zip(diag)
        .map(|(&n, forced)| {
            if n == 1 || n > config.max_size_triangular || too_few_axes || forced {
                FactorKind::Diagonal
            } else {
                FactorKind::Triangular
            }
        })
        .collect()
}

/// Scaled-identity factors; the init scale is split evenly across axes.
pub fn initial_factors(
    layout: &MergedLayout,
    config: &PsgdConfig,
    device: &Device,
) -> PrecondResult<Vec<Factor>> {
    let dims = layout.merged();
    let scale = config.precond_init_scale.powf(1.0 / dims.len() as f64);
    psgd_factor_kinds(dims, config)
        .into_iter()
        .zip(dims)
        .map(|(kind, &n)| Factor::init(kind, n, scale, device))
        .collect()
}

/// Standard-normal probe of the given shape.
pub fn sample_probe<R: Rng>(dims: &[usize], rng: &mut R, device: &Device) -> PrecondResult<Tensor> {
    let numel: usize = dims.iter().product();
    let data: Vec<f32> = (0..numel).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(data, dims, device)?)
}

fn inf_norm(factor: &Factor) -> PrecondResult<Option<f64>> {
    match factor.tensor() {
        None => Ok(None),
        Some(t) => {
            let v = t.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
            Ok(Some(v as f64))
        }
    }
}

/// Rescale factors to a common infinity norm, keeping their product fixed.
///
/// Returns `false` (and leaves the factors alone) when there is nothing to
/// balance or a norm is zero or non-finite.
pub fn balance(factors: &mut [Factor]) -> PrecondResult<bool> {
    let mut norms = Vec::with_capacity(factors.len());
    for (axis, factor) in factors.iter().enumerate() {
        if let Some(norm) = inf_norm(factor)? {
            norms.push((axis, norm));
        }
    }
    if norms.len() < 2 || norms.iter().any(|(_, n)| !(*n > 0.0 && n.is_finite())) {
        return Ok(false);
    }
    let log_mean = norms.iter().map(|(_, n)| n.ln()).sum::<f64>() / norms.len() as f64;
    let geomean = log_mean.exp();
    for (axis, norm) in norms {
        let scale = geomean / norm;
        factors[axis] = match &factors[axis] {
            Factor::Triangular(q) => Factor::Triangular((q * scale)?),
            Factor::Diagonal(d) => Factor::Diagonal((d * scale)?),
            Factor::Full(q) => Factor::Full((q * scale)?),
            Factor::Identity => Factor::Identity,
        };
    }
    Ok(true)
}

/// One step of the whitening fit.
///
/// With `A = Q·G` and `B = Q⁻ᵀ·V` taken along every axis and
/// `a = A₍ᵢ₎A₍ᵢ₎ᵀ`, `b = B₍ᵢ₎B₍ᵢ₎ᵀ` per axis:
///
/// - triangular: `Q ← Q - lr · triu(a - b) / lb(a + b) · Q`, where `lb` is a
///   lower bound on the spectral norm;
/// - diagonal: `q ← q - lr · (a - b) ⊙ q / ‖a + b‖∞`.
///
/// Returns `None` when a factor is singular or the result is not finite;
/// the caller keeps the previous factors.
pub fn update_factors(
    factors: &[Factor],
    probe: &Tensor,
    grad: &Tensor,
    precond_lr: f64,
    pool: &mut ScratchPool,
) -> PrecondResult<Option<Vec<Factor>>> {
    let mut a = grad.clone();
    let mut b = probe.clone();
    for (axis, factor) in factors.iter().enumerate() {
        a = factor.mul(&a, axis)?;
        b = match factor.try_apply_inverse(&b, axis, pool)? {
            Some(b) => b,
            None => return Ok(None),
        };
    }

    let mut updated = Vec::with_capacity(factors.len());
    for (axis, factor) in factors.iter().enumerate() {
        let next = match factor {
            Factor::Triangular(q) => {
                let aa = linalg::to_matrix(&axis_outer(&a, axis)?, pool)?;
                let bb = linalg::to_matrix(&axis_outer(&b, axis)?, pool)?;
                let step = triangular_step(&aa, &bb, precond_lr);
                pool.recycle(aa);
                pool.recycle(bb);
                let qm = linalg::to_matrix(q, pool)?;
                let next = &qm - &step * &qm;
                pool.recycle(qm);
                if !linalg::is_finite(&next) {
                    return Ok(None);
                }
                Factor::Triangular(linalg::from_matrix(next, q.device(), pool)?)
            }
            Factor::Diagonal(d) => {
                let aa = axis_sumsq(&a, axis)?;
                let bb = axis_sumsq(&b, axis)?;
                let norm = (&aa + &bb)?
                    .abs()?
                    .max(0)?
                    .to_scalar::<f32>()? as f64;
                let step = ((aa - bb)? * d)?;
                let next = (d - (step * (precond_lr / norm.max(TINY)))?)?;
                Factor::Diagonal(next)
            }
            other => other.clone(),
        };
        if !next.is_finite()? {
            return Ok(None);
        }
        updated.push(next);
    }
    Ok(Some(updated))
}

/// `lr · triu(a - b) / max(lb(a + b), tiny)`
fn triangular_step(aa: &DMatrix<f64>, bb: &DMatrix<f64>, lr: f64) -> DMatrix<f64> {
    let sum = aa + bb;
    let norm = linalg::max_abs(&sum);
    let lb = if norm > 0.0 {
        linalg::spectral_norm_lower_bound(&sum, norm)
    } else {
        0.0
    };
    (aa - bb).upper_triangle() * (lr / lb.max(TINY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::precondition_merged;
    use candle_core::{DType, Result};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn config(max_size: usize) -> PsgdConfig {
        PsgdConfig::default().with_max_size_triangular(max_size)
    }

    #[test]
    fn test_threshold_boundary() {
        let cfg = config(8);
        assert_eq!(
            psgd_factor_kinds(&[8, 4], &cfg),
            vec![FactorKind::Triangular, FactorKind::Triangular]
        );
        assert_eq!(
            psgd_factor_kinds(&[9, 4], &cfg),
            vec![FactorKind::Diagonal, FactorKind::Triangular]
        );
    }

    #[test]
    fn test_low_rank_params_are_diagonal() {
        let cfg = config(64);
        assert_eq!(psgd_factor_kinds(&[16], &cfg), vec![FactorKind::Diagonal]);
        assert_eq!(
            psgd_factor_kinds(&[1, 16], &cfg),
            vec![FactorKind::Diagonal, FactorKind::Triangular]
        );
        let one_diag = cfg.with_memory_save_mode(Some(crate::config::MemorySaveMode::OneDiag));
        assert_eq!(
            psgd_factor_kinds(&[16, 32], &one_diag),
            vec![FactorKind::Triangular, FactorKind::Diagonal]
        );
    }

    #[test]
    fn test_init_scale_split_across_axes() -> Result<()> {
        let device = Device::Cpu;
        let cfg = config(64).with_precond_init_scale(4.0);
        let layout = MergedLayout::new(&[3, 5], 64, false);
        let factors = initial_factors(&layout, &cfg, &device).unwrap();
        let q0 = factors[0].tensor().unwrap().to_vec2::<f32>()?;
        assert!((q0[0][0] - 2.0).abs() < 1e-6);
        assert_eq!(q0[0][1], 0.0);
        Ok(())
    }

    #[test]
    fn test_balance_preserves_product() -> Result<()> {
        let device = Device::Cpu;
        let mut factors = vec![
            Factor::init(FactorKind::Triangular, 3, 8.0, &device).unwrap(),
            Factor::init(FactorKind::Diagonal, 2, 0.5, &device).unwrap(),
        ];
        assert!(balance(&mut factors).unwrap());
        let n0 = inf_norm(&factors[0]).unwrap().unwrap();
        let n1 = inf_norm(&factors[1]).unwrap().unwrap();
        assert!((n0 - 2.0).abs() < 1e-6 && (n1 - 2.0).abs() < 1e-6);
        assert!((n0 * n1 - 4.0).abs() < 1e-5);

        let mut single = vec![Factor::init(FactorKind::Diagonal, 2, 3.0, &device).unwrap()];
        assert!(!balance(&mut single).unwrap());
        Ok(())
    }

    #[test]
    fn test_probe_is_seeded() -> Result<()> {
        let device = Device::Cpu;
        let mut r1 = ChaCha8Rng::seed_from_u64(5);
        let mut r2 = ChaCha8Rng::seed_from_u64(5);
        let a = sample_probe(&[4, 3], &mut r1, &device).unwrap();
        let b = sample_probe(&[4, 3], &mut r2, &device).unwrap();
        assert_eq!(a.to_vec2::<f32>()?, b.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_updates_stay_triangular() -> Result<()> {
        let device = Device::Cpu;
        let mut pool = ScratchPool::default();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let layout = MergedLayout::new(&[4, 6], 64, false);
        let factors = initial_factors(&layout, &config(64), &device).unwrap();
        let grad = sample_probe(&[4, 6], &mut rng, &device).unwrap();
        let probe = sample_probe(&[4, 6], &mut rng, &device).unwrap();
        let next = update_factors(&factors, &probe, &grad, 0.1, &mut pool)
            .unwrap()
            .unwrap();
        let q = next[1].tensor().unwrap().to_vec2::<f32>()?;
        for (r, row) in q.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                if c < r {
                    assert_eq!(*v, 0.0);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_fit_whitens_scaled_gradients() -> Result<()> {
        // Gradients with per-row scales 1 and 10: the fitted preconditioner
        // should shrink the loud row relative to the quiet one.
        let device = Device::Cpu;
        let mut pool = ScratchPool::default();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let layout = MergedLayout::new(&[2, 32], 64, false);
        let cfg = config(64).with_memory_save_mode(Some(crate::config::MemorySaveMode::OneDiag));
        let mut factors = initial_factors(&layout, &cfg, &device).unwrap();
        let scales = Tensor::new(&[[1f32], [10.0]], &device)?;
        for _ in 0..300 {
            let noise = sample_probe(&[2, 32], &mut rng, &device).unwrap();
            let grad = noise.broadcast_mul(&scales)?;
            let probe = sample_probe(&[2, 32], &mut rng, &device).unwrap();
            if let Some(next) = update_factors(&factors, &probe, &grad, 0.1, &mut pool).unwrap() {
                factors = next;
            }
        }
        let ones = Tensor::ones((2, 32), DType::F32, &device)?;
        let p = precondition_merged(&ones, &factors).unwrap().to_vec2::<f32>()?;
        let quiet: f32 = p[0].iter().sum::<f32>() / 32.0;
        let loud: f32 = p[1].iter().sum::<f32>() / 32.0;
        assert!(quiet > 3.0 * loud.abs(), "quiet {} loud {}", quiet, loud);
        Ok(())
    }
}
