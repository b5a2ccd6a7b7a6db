//! SOAP engine: Adam in the eigenbasis of per-axis Gram statistics.
//!
//! Per step and parameter: Gram update, optional basis refresh, forward
//! projection, moment update, inverse projection. The first gradient of a
//! parameter only initializes its statistics and basis.

use candle_core::{DType, Tensor};
use tracing::debug;

use crate::checkpoint::{EngineKind, EngineSnapshot};
use crate::config::SoapConfig;
use crate::error::{PrecondError, PrecondResult};
use crate::factor::{Factor, FactorKind};
use crate::gram::{update_grams, GramBlend};
use crate::linalg::{PoolStats, ScratchPool};
use crate::logging::{log_refresh_summary, SUMMARY_INTERVAL};
use crate::merge::MergedLayout;
use crate::moments::{scaled_direction, update_exp_avg, update_exp_avg_sq, MomentBetas};
use crate::project::{project, project_merged, Direction};
use crate::schedule::{RefreshDecision, UpdateScheduler};
use crate::solver::eigen::{self, soap_factor_kinds};
use crate::state::{ParamId, ParameterState, RefreshStats, StateStore};

pub struct SoapPreconditioner {
    config: SoapConfig,
    states: StateStore,
    scheduler: UpdateScheduler,
    pool: ScratchPool,
    step: u64,
}

impl SoapPreconditioner {
    pub fn new(config: SoapConfig) -> PrecondResult<Self> {
        config.check()?;
        let scheduler = UpdateScheduler::new(config.refresh, config.seed);
        Ok(Self {
            config,
            states: StateStore::new(),
            scheduler,
            pool: ScratchPool::default(),
            step: 0,
        })
    }

    pub fn config(&self) -> &SoapConfig {
        &self.config
    }

    /// Optimizer steps taken so far.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn state(&self, id: ParamId) -> Option<&ParameterState> {
        self.states.get(id)
    }

    pub fn states(&self) -> &StateStore {
        &self.states
    }

    pub fn scheduler(&self) -> &UpdateScheduler {
        &self.scheduler
    }

    pub fn refresh_stats(&self) -> RefreshStats {
        self.states.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Forget a parameter; its next gradient starts from scratch.
    pub fn remove(&mut self, id: ParamId) -> Option<ParameterState> {
        self.states.remove(id)
    }

    /// One optimizer step over a batch of gradients.
    ///
    /// Returns one entry per input, in order: `None` for a parameter's first
    /// step, otherwise the preconditioned update in the parameter's shape.
    /// On error nothing is committed, including the scheduler draw.
    pub fn step(&mut self, grads: &[(ParamId, Tensor)]) -> PrecondResult<Vec<Option<Tensor>>> {
        self.states.check_batch(grads)?;

        let mut scheduler = self.scheduler.clone();
        let decision = scheduler.decide();

        let mut staged = Vec::with_capacity(grads.len());
        let mut updates = Vec::with_capacity(grads.len());
        for (id, grad) in grads {
            let grad = grad.to_dtype(DType::F32)?;
            match self.states.get(*id).cloned() {
                Some(mut state) => {
                    let update = self.advance(*id, &mut state, &grad, decision)?;
                    staged.push((*id, state));
                    updates.push(Some(update));
                }
                None => {
                    staged.push((*id, self.init_state(*id, &grad)?));
                    updates.push(None);
                }
            }
        }

        self.states.commit(staged);
        self.scheduler = scheduler;
        self.step += 1;
        if self.step % SUMMARY_INTERVAL == 0 {
            log_refresh_summary("soap", self.step, &self.states.stats());
        }
        Ok(updates)
    }

    /// Project an arbitrary tensor of a known parameter's shape with that
    /// parameter's current basis.
    pub fn project(&mut self, id: ParamId, x: &Tensor, direction: Direction) -> PrecondResult<Tensor> {
        let state = self.states.get(id).ok_or_else(|| {
            PrecondError::Tensor(format!("{} has no preconditioner state yet", id))
        })?;
        state.check_shape(id, x)?;
        project(x, &state.factors, &state.layout, direction, &mut self.pool)
    }

    fn init_state(&mut self, id: ParamId, grad: &Tensor) -> PrecondResult<ParameterState> {
        let cfg = &self.config;
        let layout = MergedLayout::new(grad.dims(), cfg.max_precond_dim, cfg.merge_dims);
        let kinds = soap_factor_kinds(
            &layout,
            cfg.max_precond_dim,
            cfg.precondition_1d,
            cfg.memory_save_mode,
        );
        let device = grad.device();
        let factors = kinds
            .iter()
            .zip(layout.merged())
            .map(|(&kind, &n)| Factor::init(kind, n, 1.0, device))
            .collect::<PrecondResult<Vec<_>>>()?;

        let mut state = ParameterState::new(layout, factors, device)?;
        for (axis, kind) in kinds.iter().enumerate() {
            if *kind == FactorKind::Full {
                let n = state.layout.merged()[axis];
                state.grams[axis] = Some(Tensor::zeros((n, n), DType::F32, device)?);
            }
        }

        let g = state.layout.merge(grad)?;
        update_grams(&mut state.grams, &g, GramBlend::Exact)?;
        state.step = 1;
        eigen::init_bases(id, &mut state, &mut self.pool)?;
        debug!(param = %id, shape = ?grad.dims(), factors = ?kinds, "created SOAP state");
        Ok(state)
    }

    fn advance(
        &mut self,
        id: ParamId,
        state: &mut ParameterState,
        grad: &Tensor,
        decision: RefreshDecision,
    ) -> PrecondResult<Tensor> {
        state.step += 1;
        // moment steps start after the initializing step
        let k = state.step - 1;
        let betas = MomentBetas::at(self.config.beta1, &self.config.beta2, k);
        let g = state.layout.merge(grad)?;

        let shampoo_beta = self.config.shampoo_beta.unwrap_or(betas.beta2);
        update_grams(&mut state.grams, &g, GramBlend::Ema(shampoo_beta))?;

        let has_basis = state.factors.iter().any(|f| matches!(f, Factor::Full(_)));
        if has_basis && decision.applies_to(k) {
            eigen::refresh_bases(id, state, &mut self.pool)?;
        }

        let g_proj = project_merged(&g, &state.factors, Direction::Forward, &mut self.pool)?;
        state.exp_avg = update_exp_avg(&state.exp_avg, &g, betas.beta1)?;
        let m_proj = project_merged(
            &state.exp_avg,
            &state.factors,
            Direction::Forward,
            &mut self.pool,
        )?;
        state.exp_avg_sq = update_exp_avg_sq(&state.exp_avg_sq, &g_proj, betas.beta2)?;

        let direction = scaled_direction(&m_proj, &state.exp_avg_sq, self.config.eps)?;
        let update = project_merged(&direction, &state.factors, Direction::Inverse, &mut self.pool)?;
        state.layout.unmerge(&update)
    }

    pub fn snapshot(&self) -> PrecondResult<EngineSnapshot> {
        Ok(EngineSnapshot {
            engine: EngineKind::Soap,
            step: self.step,
            scheduler: self.scheduler.snapshot(),
            probe_rng: None,
            params: self.states.snapshot()?,
        })
    }

    /// Replace all state with a snapshot taken from an engine with the same
    /// refresh policy.
    pub fn restore(
        &mut self,
        snapshot: &EngineSnapshot,
        device: &candle_core::Device,
    ) -> PrecondResult<()> {
        if snapshot.engine != EngineKind::Soap {
            return Err(PrecondError::Config(format!(
                "cannot restore a {:?} snapshot into SOAP",
                snapshot.engine
            )));
        }
        if snapshot.scheduler.policy != self.config.refresh {
            return Err(PrecondError::Config(format!(
                "snapshot refresh policy {:?} differs from configured {:?}",
                snapshot.scheduler.policy, self.config.refresh
            )));
        }
        let states = StateStore::restore(&snapshot.params, device)?;
        self.states = states;
        self.scheduler = UpdateScheduler::restore(&snapshot.scheduler);
        self.step = snapshot.step;
        Ok(())
    }
}
