//! Adam-style first and second moments.
//!
//! Moments are kept bias-corrected: the EMA coefficients come from
//! [`beta_debias`], which makes the running average equal `m_k / (1 - βᵏ)`.

use candle_core::{Result, Tensor};

use crate::config::Beta2Schedule;
use crate::schedule::beta_debias;

/// Debiased EMA coefficients for one moment step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MomentBetas {
    pub beta1: f64,
    pub beta2: f64,
}

impl MomentBetas {
    pub fn at(beta1: f64, beta2: &Beta2Schedule, step: u64) -> Self {
        Self {
            beta1: beta_debias(beta1, step),
            beta2: beta_debias(beta2.at(step), step),
        }
    }
}

/// `m + (g - m)·(1 - β₁)`
pub fn update_exp_avg(exp_avg: &Tensor, grad: &Tensor, beta1: f64) -> Result<Tensor> {
    exp_avg + ((grad - exp_avg)? * (1.0 - beta1))?
}

/// `β₂·v + (1 - β₂)·g²`
pub fn update_exp_avg_sq(exp_avg_sq: &Tensor, grad: &Tensor, beta2: f64) -> Result<Tensor> {
    (exp_avg_sq * beta2)? + (grad.sqr()? * (1.0 - beta2))?
}

/// `m / (√v + eps)`
pub fn scaled_direction(exp_avg: &Tensor, exp_avg_sq: &Tensor, eps: f64) -> Result<Tensor> {
    exp_avg / (exp_avg_sq.sqrt()? + eps)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_first_step_copies_gradient() -> Result<()> {
        let device = Device::Cpu;
        let g = Tensor::new(&[1f32, -2.0, 3.0], &device)?;
        let zeros = g.zeros_like()?;
        let betas = MomentBetas::at(0.9, &Beta2Schedule::Constant(0.999), 1);
        let m = update_exp_avg(&zeros, &g, betas.beta1)?;
        let v = update_exp_avg_sq(&zeros, &g, betas.beta2)?;
        assert_eq!(m.to_vec1::<f32>()?, vec![1.0, -2.0, 3.0]);
        assert_eq!(v.to_vec1::<f32>()?, vec![1.0, 4.0, 9.0]);
        let dir = scaled_direction(&m, &v, 0.0)?.to_vec1::<f32>()?;
        assert_eq!(dir, vec![1.0, -1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_constant_gradient_stays_fixed() -> Result<()> {
        let device = Device::Cpu;
        let g = Tensor::new(&[0.5f32, -0.25], &device)?;
        let mut m = g.zeros_like()?;
        let mut v = g.zeros_like()?;
        for k in 1..=10 {
            let betas = MomentBetas::at(0.9, &Beta2Schedule::Palm { scale: 0.8 }, k);
            m = update_exp_avg(&m, &g, betas.beta1)?;
            v = update_exp_avg_sq(&v, &g, betas.beta2)?;
        }
        let m = m.to_vec1::<f32>()?;
        let v = v.to_vec1::<f32>()?;
        assert!((m[0] - 0.5).abs() < 1e-6 && (m[1] + 0.25).abs() < 1e-6);
        assert!((v[0] - 0.25).abs() < 1e-6 && (v[1] - 0.0625).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_eps_guards_zero_variance() -> Result<()> {
        let device = Device::Cpu;
        let zeros = Tensor::zeros(4, candle_core::DType::F32, &device)?;
        let dir = scaled_direction(&zeros, &zeros, 1e-8)?.to_vec1::<f32>()?;
        assert!(dir.iter().all(|v| *v == 0.0));
        Ok(())
    }
}
