//! SOAP optimizer: PaLM β₂ schedule, Adam in the Kronecker eigenbasis.

use candle_core::{backprop::GradStore, Device, Tensor, Var};
use kron_precond::schedule::warmup;
use kron_precond::{EngineSnapshot, ParamId, PrecondResult, RefreshStats, SoapConfig, SoapPreconditioner};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{check_grads, collect_grads, commit_params, updated_param, var_for};

/// SOAP optimizer.
///
/// Update rule, per parameter with moment step `k`:
///   1. Engine: Gram update, optional basis refresh, Adam in the basis
///   2. Weight decay: p *= (1 - lr_k * wd)
///   3. Apply: p -= lr_k * update, with lr_k = warmup(lr, k)
///
/// A parameter's first gradient only seeds its statistics; it is not moved.
pub struct Soap {
    vars: Vec<Var>,
    engine: SoapPreconditioner,
    pub lr: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoapState {
    pub engine: EngineSnapshot,
    pub lr: f64,
}

impl Soap {
    pub fn new(vars: Vec<Var>, config: SoapConfig) -> PrecondResult<Self> {
        let lr = config.lr;
        Ok(Self {
            vars,
            engine: SoapPreconditioner::new(config)?,
            lr,
        })
    }

    pub fn step(&mut self, grads: &GradStore) -> PrecondResult<()> {
        let grads = collect_grads(&self.vars, grads)?;
        self.step_with_grads(&grads)
    }

    pub fn step_with_grads(&mut self, grads: &[(ParamId, Tensor)]) -> PrecondResult<()> {
        check_grads(&self.vars, grads)?;
        let updates = self.engine.step(grads)?;

        let cfg = self.engine.config();
        let mut staged = Vec::with_capacity(grads.len());
        for ((id, _), update) in grads.iter().zip(updates) {
            let Some(update) = update else {
                debug!(param = %id, "SOAP statistics seeded");
                continue;
            };
            let k = self.engine.state(*id).map_or(1, |s| s.step.saturating_sub(1));
            let lr = warmup(self.lr, k, cfg.warmup_steps);
            let next = updated_param(var_for(&self.vars, *id)?, &update, lr, cfg.weight_decay)?;
            staged.push((*id, next));
        }
        commit_params(&self.vars, staged)
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    pub fn engine(&self) -> &SoapPreconditioner {
        &self.engine
    }

    pub fn refresh_stats(&self) -> RefreshStats {
        self.engine.refresh_stats()
    }

    pub fn export_state(&self) -> PrecondResult<SoapState> {
        Ok(SoapState {
            engine: self.engine.snapshot()?,
            lr: self.lr,
        })
    }

    pub fn import_state(&mut self, state: &SoapState, device: &Device) -> PrecondResult<()> {
        self.engine.restore(&state.engine, device)?;
        self.lr = state.lr;
        Ok(())
    }
}
