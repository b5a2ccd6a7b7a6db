//! PSGD-Kron with Adam moments on the preconditioned gradient.

use candle_core::{backprop::GradStore, Device, Tensor, Var};
use kron_precond::schedule::warmup;
use kron_precond::{
    EngineSnapshot, ParamId, PrecondResult, PsgdConfig, PsgdPreconditioner, RefreshStats,
};
use serde::{Deserialize, Serialize};

use crate::{check_grads, collect_grads, commit_params, updated_param, var_for};

/// PSGD Kronecker optimizer.
///
/// The whitening factors are refit on a shared, annealed random schedule;
/// every step moves every parameter that has a gradient.
pub struct PsgdKron {
    vars: Vec<Var>,
    engine: PsgdPreconditioner,
    pub lr: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsgdKronState {
    pub engine: EngineSnapshot,
    pub lr: f64,
}

impl PsgdKron {
    pub fn new(vars: Vec<Var>, config: PsgdConfig) -> PrecondResult<Self> {
        let lr = config.lr;
        Ok(Self {
            vars,
            engine: PsgdPreconditioner::new(config)?,
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
            let k = self.engine.state(*id).map_or(1, |s| s.step);
            let lr = warmup(self.lr, k, cfg.warmup_steps);
            let next = updated_param(var_for(&self.vars, *id)?, &update, lr, cfg.weight_decay)?;
            staged.push((*id, next));
        }
        commit_params(&self.vars, staged)
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    pub fn engine(&self) -> &PsgdPreconditioner {
        &self.engine
    }

    pub fn refresh_stats(&self) -> RefreshStats {
        self.engine.refresh_stats()
    }

    pub fn export_state(&self) -> PrecondResult<PsgdKronState> {
        Ok(PsgdKronState {
            engine: self.engine.snapshot()?,
            lr: self.lr,
        })
    }

    pub fn import_state(&mut self, state: &PsgdKronState, device: &Device) -> PrecondResult<()> {
        self.engine.restore(&state.engine, device)?;
        self.lr = state.lr;
        Ok(())
    }
}
