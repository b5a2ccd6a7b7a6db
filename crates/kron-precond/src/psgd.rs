//! PSGD Kronecker engine with Adam-style moments on the preconditioned
//! gradient.

use candle_core::{DType, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, warn};

use crate::checkpoint::{EngineKind, EngineSnapshot, RngSnapshot};
use crate::config::PsgdConfig;
use crate::error::{PrecondError, PrecondResult};
use crate::linalg::{PoolStats, ScratchPool};
use crate::logging::{log_refresh_summary, SUMMARY_INTERVAL};
use crate::merge::MergedLayout;
use crate::moments::{scaled_direction, update_exp_avg, update_exp_avg_sq, MomentBetas};
use crate::project::{precondition, precondition_merged};
use crate::schedule::{RefreshDecision, UpdateScheduler};
use crate::solver::whiten::{self, balance, sample_probe, update_factors};
use crate::state::{ParamId, ParameterState, RefreshStats, StateStore};

/// ChaCha stream for probes and balance draws; the scheduler owns stream 0.
const PROBE_STREAM: u64 = 1;

fn probe_rng(seed: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(PROBE_STREAM);
    rng
}

pub struct PsgdPreconditioner {
    config: PsgdConfig,
    states: StateStore,
    scheduler: UpdateScheduler,
    rng: ChaCha8Rng,
    pool: ScratchPool,
    step: u64,
}

impl PsgdPreconditioner {
    pub fn new(config: PsgdConfig) -> PrecondResult<Self> {
        config.check()?;
        let scheduler = UpdateScheduler::new(config.refresh, config.seed);
        let rng = probe_rng(config.seed);
        Ok(Self {
            config,
            states: StateStore::new(),
            scheduler,
            rng,
            pool: ScratchPool::default(),
            step: 0,
        })
    }

    pub fn config(&self) -> &PsgdConfig {
        &self.config
    }

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

    pub fn remove(&mut self, id: ParamId) -> Option<ParameterState> {
        self.states.remove(id)
    }

    /// One optimizer step; returns an update per input, in order.
    ///
    /// State is created on a parameter's first gradient and that gradient
    /// is used right away. On error nothing is committed.
    pub fn step(&mut self, grads: &[(ParamId, Tensor)]) -> PrecondResult<Vec<Tensor>> {
        self.states.check_batch(grads)?;

        let mut scheduler = self.scheduler.clone();
        let decision = scheduler.decide();
        let mut rng = self.rng.clone();

        let mut staged = Vec::with_capacity(grads.len());
        let mut updates = Vec::with_capacity(grads.len());
        for (id, grad) in grads {
            let grad = grad.to_dtype(DType::F32)?;
            let mut state = match self.states.get(*id).cloned() {
                Some(state) => state,
                None => self.init_state(*id, &grad)?,
            };
            let update = self.advance(*id, &mut state, &grad, decision, &mut rng)?;
            staged.push((*id, state));
            updates.push(update);
        }

        self.states.commit(staged);
        self.scheduler = scheduler;
        self.rng = rng;
        self.step += 1;
        if self.step % SUMMARY_INTERVAL == 0 {
            log_refresh_summary("psgd", self.step, &self.states.stats());
        }
        Ok(updates)
    }

    /// Apply a known parameter's current `QᵀQ` to an arbitrary tensor.
    pub fn precondition(&self, id: ParamId, x: &Tensor) -> PrecondResult<Tensor> {
        let state = self.states.get(id).ok_or_else(|| {
            PrecondError::Tensor(format!("{} has no preconditioner state yet", id))
        })?;
        state.check_shape(id, x)?;
        precondition(x, &state.factors, &state.layout)
    }

    fn init_state(&self, id: ParamId, grad: &Tensor) -> PrecondResult<ParameterState> {
        let layout = MergedLayout::new(
            grad.dims(),
            self.config.max_size_triangular,
            self.config.merge_dims,
        );
        let factors = whiten::initial_factors(&layout, &self.config, grad.device())?;
        debug!(
            param = %id,
            shape = ?grad.dims(),
            merged_shape = ?layout.merged(),
            factors = ?factors.iter().map(|f| f.kind()).collect::<Vec<_>>(),
            "created PSGD state"
        );
        ParameterState::new(layout, factors, grad.device())
    }

    fn advance(
        &mut self,
        id: ParamId,
        state: &mut ParameterState,
        grad: &Tensor,
        decision: RefreshDecision,
        rng: &mut ChaCha8Rng,
    ) -> PrecondResult<Tensor> {
        state.step += 1;
        let k = state.step;
        let betas = MomentBetas::at(self.config.beta1, &self.config.beta2, k);
        let g = state.layout.merge(grad)?;

        if decision.applies_to(k) {
            self.refresh(id, state, &g, rng)?;
        }

        state.exp_avg = update_exp_avg(&state.exp_avg, &g, betas.beta1)?;
        let pg = precondition_merged(&g, &state.factors)?;
        state.exp_avg_sq = update_exp_avg_sq(&state.exp_avg_sq, &pg, betas.beta2)?;
        let pm = precondition_merged(&state.exp_avg, &state.factors)?;
        let update = scaled_direction(&pm, &state.exp_avg_sq, self.config.eps)?;
        state.layout.unmerge(&update)
    }

    fn refresh(
        &mut self,
        id: ParamId,
        state: &mut ParameterState,
        g: &Tensor,
        rng: &mut ChaCha8Rng,
    ) -> PrecondResult<()> {
        let mut factors = state.factors.clone();
        let rebalance = factors.len() > 1 && rng.gen::<f64>() < self.config.balance_prob;
        if rebalance && balance(&mut factors)? {
            state.stats.balances += 1;
        }

        let probe = sample_probe(state.layout.merged(), rng, g.device())?;
        match update_factors(&factors, &probe, g, self.config.precond_lr, &mut self.pool)? {
            Some(next) => {
                state.factors = next;
                state.stats.refreshes += 1;
                state.last_refresh_step = Some(state.step);
            }
            None => {
                state.stats.skipped += 1;
                warn!(
                    param = %id,
                    step = state.step,
                    skipped_total = state.stats.skipped,
                    "singular or non-finite factor update, keeping previous factors"
                );
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> PrecondResult<EngineSnapshot> {
        Ok(EngineSnapshot {
            engine: EngineKind::Psgd,
            step: self.step,
            scheduler: self.scheduler.snapshot(),
            probe_rng: Some(RngSnapshot {
                seed: self.config.seed,
                stream: self.rng.get_stream(),
                word_pos: self.rng.get_word_pos().to_string(),
            }),
            params: self.states.snapshot()?,
        })
    }

    pub fn restore(
        &mut self,
        snapshot: &EngineSnapshot,
        device: &candle_core::Device,
    ) -> PrecondResult<()> {
        if snapshot.engine != EngineKind::Psgd {
            return Err(PrecondError::Config(format!(
                "cannot restore a {:?} snapshot into PSGD",
                snapshot.engine
            )));
        }
        if snapshot.scheduler.policy != self.config.refresh {
            return Err(PrecondError::Config(format!(
                "snapshot refresh policy {:?} differs from configured {:?}",
                snapshot.scheduler.policy, self.config.refresh
            )));
        }
        let rng = match &snapshot.probe_rng {
            Some(saved) => {
                let word_pos: u128 = saved.word_pos.parse().map_err(|_| {
                    PrecondError::Config(format!("bad probe word position '{}'", saved.word_pos))
                })?;
                let mut rng = ChaCha8Rng::seed_from_u64(saved.seed);
                rng.set_stream(saved.stream);
                rng.set_word_pos(word_pos);
                rng
            }
            None => probe_rng(snapshot.scheduler.seed),
        };
        let states = StateStore::restore(&snapshot.params, device)?;
        self.states = states;
        self.scheduler = UpdateScheduler::restore(&snapshot.scheduler);
        self.rng = rng;
        self.step = snapshot.step;
        Ok(())
    }
}
