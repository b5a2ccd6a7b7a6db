//! Schedule-free AdamW with the PaLM β₂ ramp.
//!
//! The parameters hold the interpolation point `y` during training. `z` is
//! the base SGD iterate and `x` the weighted average that is evaluated;
//! only `y` and `z` are stored, `x` is recovered when switching to eval.
//! `z` and the second moment are f32 whatever the parameter dtype.

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use kron_precond::error::{config_error, mode_error};
use kron_precond::moments::update_exp_avg_sq;
use kron_precond::schedule::{beta_debias, palm_beta2, warmup};
use kron_precond::state::TensorState;
use kron_precond::{ParamId, PrecondError, PrecondResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{check_grads, collect_grads, commit_params, var_for};

fn default_lr() -> f64 {
    2.5e-3
}

fn default_beta() -> f64 {
    0.9
}

fn default_beta2_scale() -> f64 {
    0.8
}

fn default_eps() -> f64 {
    1e-8
}

fn default_weight_lr_power() -> f64 {
    2.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleFreeConfig {
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// Interpolation between `z` and the average; plays the role of β₁.
    #[serde(default = "default_beta")]
    pub beta: f64,
    #[serde(default = "default_beta2_scale")]
    pub beta2_scale: f64,
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub warmup_steps: u64,
    /// Averaging weight of a step is `lr^weight_lr_power`.
    #[serde(default = "default_weight_lr_power")]
    pub weight_lr_power: f64,
}

impl Default for ScheduleFreeConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            beta: default_beta(),
            beta2_scale: default_beta2_scale(),
            eps: default_eps(),
            weight_decay: 0.0,
            warmup_steps: 0,
            weight_lr_power: default_weight_lr_power(),
        }
    }
}

impl ScheduleFreeConfig {
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_beta(mut self, beta: f64) -> Self {
        self.beta = beta;
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
        if !(0.0..1.0).contains(&self.beta) {
            errors.push(format!("beta ({}) must be in [0, 1)", self.beta));
        }
        if !(self.beta2_scale > 0.0) {
            errors.push(format!("beta2_scale ({}) must be positive", self.beta2_scale));
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
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Which point the parameters currently hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// `y`, where gradients are taken.
    Train,
    /// `x`, the averaged iterate.
    Eval,
}

/// Schedule-free AdamW.
///
/// Per step `k` with `lr_k = warmup(lr, k)` and `c = lr_kᵖ / Σ lr_iᵖ`:
///   v = debias(β₂(k), k)·v + (1 - ·)·g²,  u = g / (√v + eps) + wd·y
///   y = lerp(y, z, c) + lr_k·(β(1 - c) - 1)·u
///   z = z - lr_k·u
pub struct ScheduleFreeAdamW {
    vars: Vec<Var>,
    z: Vec<Option<Tensor>>,
    exp_avg_sq: Vec<Option<Tensor>>,
    config: ScheduleFreeConfig,
    weight_sum: f64,
    mode: Mode,
    step: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleFreeState {
    pub step: u64,
    pub weight_sum: f64,
    pub mode: Mode,
    pub z: Vec<Option<TensorState>>,
    pub exp_avg_sq: Vec<Option<TensorState>>,
    pub config: ScheduleFreeConfig,
}

impl ScheduleFreeAdamW {
    pub fn new(vars: Vec<Var>, config: ScheduleFreeConfig) -> PrecondResult<Self> {
        config
            .validate()
            .map_err(|errors| config_error(errors.join("; ")))?;
        let n = vars.len();
        Ok(Self {
            vars,
            z: vec![None; n],
            exp_avg_sq: vec![None; n],
            config,
            weight_sum: 0.0,
            mode: Mode::Train,
            step: 0,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn step(&mut self, grads: &GradStore) -> PrecondResult<()> {
        let grads = collect_grads(&self.vars, grads)?;
        self.step_with_grads(&grads)
    }

    pub fn step_with_grads(&mut self, grads: &[(ParamId, Tensor)]) -> PrecondResult<()> {
        if self.mode != Mode::Train {
            return Err(mode_error("schedule-free optimizer stepped in eval mode; call train() first"));
        }
        check_grads(&self.vars, grads)?;

        let k = self.step + 1;
        let beta2 = beta_debias(palm_beta2(k, self.config.beta2_scale), k);
        let lr = warmup(self.config.lr, k, self.config.warmup_steps);
        let weight = lr.powf(self.config.weight_lr_power);
        let weight_sum = self.weight_sum + weight;
        let ckp1 = if weight_sum > 0.0 { weight / weight_sum } else { 0.0 };
        let beta = self.config.beta;

        let mut staged = Vec::with_capacity(grads.len());
        for (id, grad) in grads {
            let i = id.0 as usize;
            let var = var_for(&self.vars, *id)?;
            let y = var.as_tensor().to_dtype(DType::F32)?;
            let grad = grad.to_dtype(DType::F32)?;
            let z = match &self.z[i] {
                Some(z) => z.clone(),
                None => y.copy()?,
            };
            let v = match &self.exp_avg_sq[i] {
                Some(v) => v.clone(),
                None => y.zeros_like()?,
            };

            let v = update_exp_avg_sq(&v, &grad, beta2)?;
            let mut u = (&grad / (v.sqrt()? + self.config.eps)?)?;
            if self.config.weight_decay != 0.0 {
                u = (u + (&y * self.config.weight_decay)?)?;
            }
            let y_next = ((&y + ((&z - &y)? * ckp1)?)? + (&u * (lr * (beta * (1.0 - ckp1) - 1.0)))?)?;
            let z_next = (&z - (&u * lr)?)?;
            staged.push((*id, y_next.to_dtype(var.dtype())?, z_next, v));
        }

        let mut params = Vec::with_capacity(staged.len());
        for (id, y, z, v) in staged {
            let i = id.0 as usize;
            self.z[i] = Some(z);
            self.exp_avg_sq[i] = Some(v);
            params.push((id, y));
        }
        commit_params(&self.vars, params)?;
        self.weight_sum = weight_sum;
        self.step = k;
        Ok(())
    }

    /// Switch the parameters to the averaged point `x`.
    pub fn eval(&mut self) -> PrecondResult<()> {
        if self.mode == Mode::Eval {
            return Ok(());
        }
        // x = y + (z - y)·(1 - 1/β)
        if self.config.beta > 0.0 {
            self.interpolate(1.0 - 1.0 / self.config.beta)?;
        }
        self.mode = Mode::Eval;
        debug!(step = self.step, "schedule-free optimizer switched to eval");
        Ok(())
    }

    /// Switch the parameters back to the gradient point `y`.
    pub fn train(&mut self) -> PrecondResult<()> {
        if self.mode == Mode::Train {
            return Ok(());
        }
        // y = x + (z - x)·(1 - β)
        if self.config.beta > 0.0 {
            self.interpolate(1.0 - self.config.beta)?;
        }
        self.mode = Mode::Train;
        debug!(step = self.step, "schedule-free optimizer switched to train");
        Ok(())
    }

    fn interpolate(&mut self, weight: f64) -> PrecondResult<()> {
        for (var, z) in self.vars.iter().zip(&self.z) {
            if let Some(z) = z {
                let p = var.as_tensor().to_dtype(DType::F32)?;
                let moved = (&p + ((z - &p)? * weight)?)?;
                var.set(&moved.to_dtype(var.dtype())?)?;
            }
        }
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

    pub fn export_state(&self) -> PrecondResult<ScheduleFreeState> {
        let snap = |ts: &[Option<Tensor>]| -> PrecondResult<Vec<Option<TensorState>>> {
            ts.iter()
                .map(|t| t.as_ref().map(TensorState::from_tensor).transpose())
                .collect()
        };
        Ok(ScheduleFreeState {
            step: self.step,
            weight_sum: self.weight_sum,
            mode: self.mode,
            z: snap(&self.z)?,
            exp_avg_sq: snap(&self.exp_avg_sq)?,
            config: self.config.clone(),
        })
    }

    /// Restore optimizer state. The parameters themselves are not touched;
    /// they must hold the point that matches `state.mode`.
    pub fn import_state(&mut self, state: &ScheduleFreeState) -> PrecondResult<()> {
        let n = self.vars.len();
        if state.z.len() != n || state.exp_avg_sq.len() != n {
            return Err(PrecondError::Config(format!(
                "schedule-free state mismatch: expected {} slots, got {} and {}",
                n,
                state.z.len(),
                state.exp_avg_sq.len()
            )));
        }
        let restore = |snaps: &[Option<TensorState>]| -> PrecondResult<Vec<Option<Tensor>>> {
            snaps
                .iter()
                .zip(&self.vars)
                .enumerate()
                .map(|(i, (snap, var))| match snap {
                    None => Ok(None),
                    Some(snap) if snap.shape != var.dims() => Err(PrecondError::ShapeMismatch {
                        param: ParamId(i as u64),
                        expected: var.dims().to_vec(),
                        got: snap.shape.clone(),
                    }),
                    Some(snap) => snap.to_tensor(var.device()).map(Some),
                })
                .collect()
        };
        let z = restore(&state.z)?;
        let exp_avg_sq = restore(&state.exp_avg_sq)?;

        self.z = z;
        self.exp_avg_sq = exp_avg_sq;
        self.weight_sum = state.weight_sum;
        self.mode = state.mode;
        self.config = state.config.clone();
        self.step = state.step;
        Ok(())
    }
}
