//! Optimizer wrapper for selecting a front-end from config.

use candle_core::{backprop::GradStore, Device, Tensor, Var};
use kron_precond::{ParamId, PrecondError, PrecondResult, PsgdConfig, SoapConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    AdamW, AdamWConfig, AdamWState, PsgdKron, PsgdKronState, ScheduleFreeAdamW,
    ScheduleFreeConfig, ScheduleFreeState, Soap, SoapState,
};

/// Serializable choice of optimizer and its hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerKind {
    Soap(SoapConfig),
    Psgd(PsgdConfig),
    AdamW(AdamWConfig),
    ScheduleFree(ScheduleFreeConfig),
}

impl OptimizerKind {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerKind::Soap(_) => "soap",
            OptimizerKind::Psgd(_) => "psgd",
            OptimizerKind::AdamW(_) => "adamw",
            OptimizerKind::ScheduleFree(_) => "schedule_free",
        }
    }
}

/// Wrapper enum over every front-end.
pub enum KronOptimizer {
    Soap(Soap),
    Psgd(PsgdKron),
    AdamW(AdamW),
    ScheduleFree(ScheduleFreeAdamW),
}

/// Saved state of whichever front-end is wrapped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerState {
    Soap(SoapState),
    Psgd(PsgdKronState),
    AdamW(AdamWState),
    ScheduleFree(ScheduleFreeState),
}

impl KronOptimizer {
    pub fn from_config(vars: Vec<Var>, kind: OptimizerKind) -> PrecondResult<Self> {
        let name = kind.name();
        let n_params = vars.len();
        let opt = match kind {
            OptimizerKind::Soap(cfg) => KronOptimizer::Soap(Soap::new(vars, cfg)?),
            OptimizerKind::Psgd(cfg) => KronOptimizer::Psgd(PsgdKron::new(vars, cfg)?),
            OptimizerKind::AdamW(cfg) => KronOptimizer::AdamW(AdamW::new(vars, cfg)?),
            OptimizerKind::ScheduleFree(cfg) => {
                KronOptimizer::ScheduleFree(ScheduleFreeAdamW::new(vars, cfg)?)
            }
        };
        info!(optimizer = name, params = n_params, "Optimizer created");
        Ok(opt)
    }

    pub fn step(&mut self, grads: &GradStore) -> PrecondResult<()> {
        match self {
            KronOptimizer::Soap(o) => o.step(grads),
            KronOptimizer::Psgd(o) => o.step(grads),
            KronOptimizer::AdamW(o) => o.step(grads),
            KronOptimizer::ScheduleFree(o) => o.step(grads),
        }
    }

    pub fn step_with_grads(&mut self, grads: &[(ParamId, Tensor)]) -> PrecondResult<()> {
        match self {
            KronOptimizer::Soap(o) => o.step_with_grads(grads),
            KronOptimizer::Psgd(o) => o.step_with_grads(grads),
            KronOptimizer::AdamW(o) => o.step_with_grads(grads),
            KronOptimizer::ScheduleFree(o) => o.step_with_grads(grads),
        }
    }

    pub fn lr(&self) -> f64 {
        match self {
            KronOptimizer::Soap(o) => o.lr,
            KronOptimizer::Psgd(o) => o.lr,
            KronOptimizer::AdamW(o) => o.lr(),
            KronOptimizer::ScheduleFree(o) => o.lr(),
        }
    }

    pub fn set_lr(&mut self, lr: f64) {
        match self {
            KronOptimizer::Soap(o) => o.set_lr(lr),
            KronOptimizer::Psgd(o) => o.set_lr(lr),
            KronOptimizer::AdamW(o) => o.set_lr(lr),
            KronOptimizer::ScheduleFree(o) => o.set_lr(lr),
        }
    }

    /// Move parameters to the point used for training. A no-op for
    /// optimizers without modes.
    pub fn train(&mut self) -> PrecondResult<()> {
        match self {
            KronOptimizer::ScheduleFree(o) => o.train(),
            _ => Ok(()),
        }
    }

    /// Move parameters to the point used for evaluation.
    pub fn eval(&mut self) -> PrecondResult<()> {
        match self {
            KronOptimizer::ScheduleFree(o) => o.eval(),
            _ => Ok(()),
        }
    }

    pub fn export_state(&self) -> PrecondResult<OptimizerState> {
        Ok(match self {
            KronOptimizer::Soap(o) => OptimizerState::Soap(o.export_state()?),
            KronOptimizer::Psgd(o) => OptimizerState::Psgd(o.export_state()?),
            KronOptimizer::AdamW(o) => OptimizerState::AdamW(o.export_state()?),
            KronOptimizer::ScheduleFree(o) => OptimizerState::ScheduleFree(o.export_state()?),
        })
    }

    pub fn import_state(&mut self, state: &OptimizerState, device: &Device) -> PrecondResult<()> {
        match (self, state) {
            (KronOptimizer::Soap(o), OptimizerState::Soap(s)) => o.import_state(s, device),
            (KronOptimizer::Psgd(o), OptimizerState::Psgd(s)) => o.import_state(s, device),
            (KronOptimizer::AdamW(o), OptimizerState::AdamW(s)) => o.import_state(s),
            (KronOptimizer::ScheduleFree(o), OptimizerState::ScheduleFree(s)) => o.import_state(s),
            (opt, _) => Err(PrecondError::Config(format!(
                "saved optimizer state does not match the configured {} optimizer",
                opt.name()
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KronOptimizer::Soap(_) => "soap",
            KronOptimizer::Psgd(_) => "psgd",
            KronOptimizer::AdamW(_) => "adamw",
            KronOptimizer::ScheduleFree(_) => "schedule_free",
        }
    }
}
