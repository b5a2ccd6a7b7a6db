//! AdamW in the debiased-EMA form.

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use kron_precond::error::config_error;
use kron_precond::moments::{scaled_direction, update_exp_avg, update_exp_avg_sq};
use kron_precond::schedule::{beta_debias, warmup};
use kron_precond::state::TensorState;
use kron_precond::{ParamId, PrecondError, PrecondResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{check_grads, collect_grads, commit_params, updated_param, var_for};

fn default_lr() -> f64 {
    2.5e-3
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.99
}

fn default_eps() -> f64 {
    1e-8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub warmup_steps: u64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            weight_decay: 0.0,
            warmup_steps: 0,
        }
    }
}

impl AdamWConfig {
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_warmup_steps(mut self, warmup_steps: u64) -> Self {
        self.warmup_steps = warmup_steps;
        self
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if !(self.lr >= 0.0 && self.lr.is_finite()) {
            errors.push(format!("lr ({}) must be finite and non-negative", self.lr));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                errors.push(format!("{} ({}) must be in [0, 1)", name, beta));
            }
        }
        if !(self.eps >= 0.0) {
            errors.push(format!("eps ({}) must be non-negative", self.eps));
        }
        if !(self.weight_decay >= 0.0) {
            errors.push(format!(
                "weight_decay ({}) must be non-negative",
                self.weight_decay
            ));
        }
        if self.lr * self.weight_decay >= 1.0 {
            warn!(
                "Config warning: lr * weight_decay = {} flips parameter signs every step",
                self.lr * self.weight_decay
            );
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// AdamW.
///
/// Moments are f32 whatever the parameter dtype and are kept bias-corrected, so with `k` the optimizer step:
///   m = lerp(m, g, 1 - debias(β₁, k)), v = debias(β₂, k)·v + (1 - ·)·g²
///   p = p·(1 - lr·wd) - lr · m / (√v + eps)
pub struct AdamW {
    vars: Vec<Var>,
    exp_avg: Vec<Tensor>,
    exp_avg_sq: Vec<Tensor>,
    config: AdamWConfig,
    step: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamWState {
    pub step: u64,
    pub exp_avg: Vec<TensorState>,
    pub exp_avg_sq: Vec<TensorState>,
    pub config: AdamWConfig,
}

impl AdamW {
    pub fn new(vars: Vec<Var>, config: AdamWConfig) -> PrecondResult<Self> {
        config
            .validate()
            .map_err(|errors| config_error(errors.join("; ")))?;
        let exp_avg = vars
            .iter()
            .map(|v| Tensor::zeros(v.dims(), DType::F32, v.device()))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let exp_avg_sq = exp_avg.clone();
        Ok(Self {
            vars,
            exp_avg,
            exp_avg_sq,
            config,
            step: 0,
        })
    }

    pub fn step(&mut self, grads: &GradStore) -> PrecondResult<()> {
        let grads = collect_grads(&self.vars, grads)?;
        self.step_with_grads(&grads)
    }

    pub fn step_with_grads(&mut self, grads: &[(ParamId, Tensor)]) -> PrecondResult<()> {
        check_grads(&self.vars, grads)?;
        let k = self.step + 1;
        let beta1 = beta_debias(self.config.beta1, k);
        let beta2 = beta_debias(self.config.beta2, k);
        let lr = warmup(self.config.lr, k, self.config.warmup_steps);

        // stage moments so a failing parameter leaves none updated
        let mut staged = Vec::with_capacity(grads.len());
        for (id, grad) in grads {
            let i = id.0 as usize;
            let grad = grad.to_dtype(DType::F32)?;
            let m = update_exp_avg(&self.exp_avg[i], &grad, beta1)?;
            let v = update_exp_avg_sq(&self.exp_avg_sq[i], &grad, beta2)?;
            let update = scaled_direction(&m, &v, self.config.eps)?;
            let next = updated_param(var_for(&self.vars, *id)?, &update, lr, self.config.weight_decay)?;
            staged.push((i, m, v, next));
        }

        let mut params = Vec::with_capacity(staged.len());
        for (i, m, v, next) in staged {
            self.exp_avg[i] = m;
            self.exp_avg_sq[i] = v;
            params.push((ParamId(i as u64), next));
        }
        commit_params(&self.vars, params)?;
        self.step = k;
        Ok(())
    }

    pub fn lr(&self) -> f64 {
        self.config.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn export_state(&self) -> PrecondResult<AdamWState> {
        Ok(AdamWState {
            step: self.step,
            exp_avg: self
                .exp_avg
                .iter()
                .map(TensorState::from_tensor)
                .collect::<PrecondResult<Vec<_>>>()?,
            exp_avg_sq: self
                .exp_avg_sq
                .iter()
                .map(TensorState::from_tensor)
                .collect::<PrecondResult<Vec<_>>>()?,
            config: self.config.clone(),
        })
    }

    pub fn import_state(&mut self, state: &AdamWState) -> PrecondResult<()> {
        let n = self.vars.len();
        if state.exp_avg.len() != n || state.exp_avg_sq.len() != n {
            return Err(PrecondError::Config(format!(
                "AdamW state mismatch: expected {} moment tensors, got {} and {}",
                n,
                state.exp_avg.len(),
                state.exp_avg_sq.len()
            )));
        }
        let restore = |snaps: &[TensorState]| -> PrecondResult<Vec<Tensor>> {
            snaps
                .iter()
                .zip(&self.vars)
                .enumerate()
                .map(|(i, (snap, var))| {
                    if snap.shape != var.dims() {
                        return Err(PrecondError::ShapeMismatch {
                            param: ParamId(i as u64),
                            expected: var.dims().to_vec(),
                            got: snap.shape.clone(),
                        });
                    }
                    snap.to_tensor(var.device())
                })
                .collect()
        };
        let exp_avg = restore(&state.exp_avg)?;
        let exp_avg_sq = restore(&state.exp_avg_sq)?;

        self.exp_avg = exp_avg;
        self.exp_avg_sq = exp_avg_sq;
        self.config = state.config.clone();
        self.step = state.step;
        Ok(())
    }
}
