//! # Kronecker-preconditioned optimizers
//!
//! Thin front-ends over [`kron_precond`] that own a list of candle `Var`s and
//! apply the engine's updates in parameter space.
//!
//! - [`Soap`]: Adam in the eigenbasis of per-axis Gram statistics
//! - [`PsgdKron`]: Adam moments on a PSGD-whitened gradient
//! - [`AdamW`]: the same moment arithmetic without a preconditioner
//! - [`ScheduleFreeAdamW`]: schedule-free averaging with explicit train/eval
//!   modes
//! - [`KronOptimizer`]: pick one of the above from an [`OptimizerKind`]
//!
//! Parameter `i` of the `Var` list is [`ParamId`]`(i)`.
//!
//! ```rust,no_run
//! use candle_core::{DType, Device, Tensor, Var};
//! use kron_optim::{Soap, SoapConfig};
//!
//! # fn main() -> kron_optim::PrecondResult<()> {
//! let w = Var::zeros((16, 8), DType::F32, &Device::Cpu)?;
//! let mut opt = Soap::new(vec![w.clone()], SoapConfig::default().with_lr(1e-2))?;
//! let loss = w.as_tensor().sqr()?.sum_all()?;
//! opt.step(&loss.backward()?)?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;

use candle_core::{backprop::GradStore, DType, Tensor, Var};

pub mod adamw;
pub mod psgd;
pub mod schedule_free;
pub mod soap;
pub mod wrapper;

pub use adamw::{AdamW, AdamWConfig, AdamWState};
pub use kron_precond::{
    Beta2Schedule, MemorySaveMode, ParamId, PrecondError, PrecondResult, ProbabilitySchedule,
    PsgdConfig, RefreshPolicy, SoapConfig,
};
pub use psgd::{PsgdKron, PsgdKronState};
pub use schedule_free::{Mode, ScheduleFreeAdamW, ScheduleFreeConfig, ScheduleFreeState};
pub use soap::{Soap, SoapState};
pub use wrapper::{KronOptimizer, OptimizerKind, OptimizerState};

/// Gradients present in `grads`, keyed by position in `vars`.
pub(crate) fn collect_grads(vars: &[Var], grads: &GradStore) -> PrecondResult<Vec<(ParamId, Tensor)>> {
    let mut out = Vec::with_capacity(vars.len());
    for (i, var) in vars.iter().enumerate() {
        if let Some(g) = grads.get(var.as_tensor()) {
            out.push((ParamId(i as u64), g.to_dtype(DType::F32)?));
        }
    }
    Ok(out)
}

/// The `Var` a gradient belongs to.
pub(crate) fn var_for(vars: &[Var], id: ParamId) -> PrecondResult<&Var> {
    vars.get(id.0 as usize).ok_or_else(|| {
        PrecondError::Config(format!(
            "{} is out of range for an optimizer over {} parameters",
            id,
            vars.len()
        ))
    })
}

/// Every id names a parameter at most once and every gradient has that
/// parameter's shape.
pub(crate) fn check_grads(vars: &[Var], grads: &[(ParamId, Tensor)]) -> PrecondResult<()> {
    let mut seen = BTreeSet::new();
    for (id, grad) in grads {
        if !seen.insert(*id) {
            return Err(PrecondError::Config(format!(
                "gradient for {} given twice in one step",
                id
            )));
        }
        let var = var_for(vars, *id)?;
        if grad.dims() != var.dims() {
            return Err(PrecondError::ShapeMismatch {
                param: *id,
                expected: var.dims().to_vec(),
                got: grad.dims().to_vec(),
            });
        }
    }
    Ok(())
}

/// Decoupled weight decay then step: `p ← p·(1 - lr·wd) - lr·update`.
///
/// Computed in f32 and cast back to the parameter's dtype; nothing is
/// written to the `Var`.
pub(crate) fn updated_param(var: &Var, update: &Tensor, lr: f64, weight_decay: f64) -> PrecondResult<Tensor> {
    let p = var.as_tensor();
    let p32 = p.to_dtype(DType::F32)?;
    let update = update.to_dtype(DType::F32)?;
    let decayed = if weight_decay != 0.0 {
        (p32 * (1.0 - lr * weight_decay))?
    } else {
        p32
    };
    Ok((decayed - (update * lr)?)?.to_dtype(p.dtype())?)
}

/// Write staged parameter values once every one of them has been computed.
pub(crate) fn commit_params(vars: &[Var], staged: Vec<(ParamId, Tensor)>) -> PrecondResult<()> {
    for (id, value) in staged {
        var_for(vars, id)?.set(&value)?;
    }
    Ok(())
}
