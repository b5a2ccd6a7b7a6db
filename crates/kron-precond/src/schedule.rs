//! Step-indexed schedules: learning-rate warmup, the PaLM β₂ ramp, EMA
//! debiasing, and the refresh gate that decides when factors are re-derived.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Linear warmup multiplier applied to `lr`.
///
/// `warmup_steps == 0` disables warmup.
pub fn warmup(lr: f64, step: u64, warmup_steps: u64) -> f64 {
    if warmup_steps == 0 {
        return lr;
    }
    lr * (step as f64 / warmup_steps as f64).min(1.0)
}

/// PaLM second-moment schedule: `β₂(k) = 1 - k^(-scale)`.
///
/// Every optimizer that ramps β₂ goes through this function.
pub fn palm_beta2(step: u64, scale: f64) -> f64 {
    1.0 - (step.max(1) as f64).powf(-scale)
}

/// EMA coefficient whose running average equals the bias-corrected Adam
/// moment: `1 - (1-β)/(1-β^k)`.
pub fn beta_debias(beta: f64, step: u64) -> f64 {
    let k = step.max(1);
    let denom = 1.0 - beta.powi(k.min(i32::MAX as u64) as i32);
    if denom <= 0.0 {
        return 0.0;
    }
    1.0 - (1.0 - beta) / denom
}

/// Annealing curve for probabilistic refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbabilitySchedule {
    Constant(f64),
    /// `p(n) = clamp(max_prob * exp(-decay * (n - flat_start)), min_prob, max_prob)`
    Anneal {
        max_prob: f64,
        min_prob: f64,
        decay: f64,
        flat_start: u64,
    },
}

impl Default for ProbabilitySchedule {
    fn default() -> Self {
        ProbabilitySchedule::Anneal {
            max_prob: 1.0,
            min_prob: 0.03,
            decay: 0.001,
            flat_start: 250,
        }
    }
}

impl ProbabilitySchedule {
    /// Refresh probability after `n` draws.
    pub fn probability(&self, n: u64) -> f64 {
        match *self {
            ProbabilitySchedule::Constant(p) => p,
            ProbabilitySchedule::Anneal {
                max_prob,
                min_prob,
                decay,
                flat_start,
            } => {
                let p = max_prob * (-decay * (n as f64 - flat_start as f64)).exp();
                p.clamp(min_prob, max_prob)
            }
        }
    }

    fn validate(&self, errors: &mut Vec<String>) {
        match *self {
            ProbabilitySchedule::Constant(p) => {
                if !(0.0..=1.0).contains(&p) {
                    errors.push(format!("refresh probability ({}) must be in [0, 1]", p));
                }
            }
            ProbabilitySchedule::Anneal {
                max_prob,
                min_prob,
                decay,
                ..
            } => {
                if !(0.0..=1.0).contains(&max_prob) || !(0.0..=1.0).contains(&min_prob) {
                    errors.push(format!(
                        "anneal probabilities ({}, {}) must be in [0, 1]",
                        min_prob, max_prob
                    ));
                }
                if min_prob > max_prob {
                    errors.push(format!(
                        "min_prob ({}) must be <= max_prob ({})",
                        min_prob, max_prob
                    ));
                }
                if !(decay >= 0.0 && decay.is_finite()) {
                    errors.push(format!("anneal decay ({}) must be finite and >= 0", decay));
                }
            }
        }
    }
}

/// When factors get re-derived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Refresh when the parameter's step is a multiple of the frequency.
    Every(u64),
    /// One shared uniform draw per optimizer step.
    Probability(ProbabilitySchedule),
}

impl RefreshPolicy {
    pub fn validate(&self, errors: &mut Vec<String>) {
        match self {
            RefreshPolicy::Every(0) => {
                errors.push("refresh frequency must be greater than 0".to_string())
            }
            RefreshPolicy::Every(_) => {}
            RefreshPolicy::Probability(schedule) => schedule.validate(errors),
        }
    }
}

/// Outcome of one scheduler tick, shared by every parameter of the step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefreshDecision {
    /// Fixed cadence; each parameter checks its own step count.
    Cadence(u64),
    /// Result of the shared draw.
    Sampled { refresh: bool, probability: f64 },
}

impl RefreshDecision {
    pub fn applies_to(&self, step: u64) -> bool {
        match *self {
            RefreshDecision::Cadence(frequency) => step % frequency.max(1) == 0,
            RefreshDecision::Sampled { refresh, .. } => refresh,
        }
    }
}

/// Persisted scheduler position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub policy: RefreshPolicy,
    pub seed: u64,
    pub draws: u64,
}

/// Refresh gate owning its own seeded generator.
#[derive(Debug, Clone)]
pub struct UpdateScheduler {
    policy: RefreshPolicy,
    seed: u64,
    draws: u64,
    rng: ChaCha8Rng,
}

impl UpdateScheduler {
    pub fn new(policy: RefreshPolicy, seed: u64) -> Self {
        Self {
            policy,
            seed,
            draws: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Advance by one optimizer step.
    ///
    /// Probability policies consume exactly one draw per call, whether or
    /// not any parameter is eligible for a refresh.
    pub fn decide(&mut self) -> RefreshDecision {
        match self.policy {
            RefreshPolicy::Every(frequency) => RefreshDecision::Cadence(frequency),
            RefreshPolicy::Probability(schedule) => {
                let probability = schedule.probability(self.draws);
                let u: f64 = self.rng.gen();
                self.draws += 1;
                RefreshDecision::Sampled {
                    refresh: u < probability,
                    probability,
                }
            }
        }
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    pub fn draws(&self) -> u64 {
        self.draws
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            policy: self.policy,
            seed: self.seed,
            draws: self.draws,
        }
    }

    /// Rebuild a scheduler at the persisted position by replaying its draws.
    pub fn restore(snapshot: &SchedulerSnapshot) -> Self {
        let mut scheduler = Self::new(snapshot.policy, snapshot.seed);
        for _ in 0..snapshot.draws {
            let _: f64 = scheduler.rng.gen();
        }
        scheduler.draws = snapshot.draws;
        scheduler
    }
}
