//! Hyperparameters for the SOAP and PSGD preconditioners.

use serde::{Deserialize, Serialize};

use crate::error::{PrecondError, PrecondResult};
use crate::schedule::{palm_beta2, ProbabilitySchedule, RefreshPolicy};

fn default_soap_lr() -> f64 {
    3e-3
}

fn default_psgd_lr() -> f64 {
    1e-3
}

fn default_beta1() -> f64 {
    0.9
}

fn default_shampoo_beta() -> Option<f64> {
    Some(0.95)
}

fn default_eps() -> f64 {
    1e-8
}

fn default_soap_weight_decay() -> f64 {
    0.01
}

fn default_max_precond_dim() -> usize {
    2048
}

fn default_soap_refresh() -> RefreshPolicy {
    RefreshPolicy::Every(2)
}

fn default_psgd_refresh() -> RefreshPolicy {
    RefreshPolicy::Probability(ProbabilitySchedule::default())
}

fn default_min_ndim_triangular() -> usize {
    2
}

fn default_precond_lr() -> f64 {
    0.1
}

fn default_precond_init_scale() -> f64 {
    1.0
}

fn default_balance_prob() -> f64 {
    0.01
}

fn default_seed() -> u64 {
    0x5eed
}

fn default_true() -> bool {
    true
}

/// Which axes give up their full factor to save memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySaveMode {
    /// The largest axis (the last one on ties) goes diagonal.
    OneDiag,
    /// Every axis goes diagonal.
    AllDiag,
}

/// Second-moment decay: constant or the PaLM ramp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Beta2Schedule {
    Constant(f64),
    Palm { scale: f64 },
}

impl Default for Beta2Schedule {
    fn default() -> Self {
        Beta2Schedule::Palm { scale: 0.8 }
    }
}

impl Beta2Schedule {
    /// Raw β₂ at moment step `k` (before debiasing).
    pub fn at(&self, step: u64) -> f64 {
        match *self {
            Beta2Schedule::Constant(beta) => beta,
            Beta2Schedule::Palm { scale } => palm_beta2(step, scale),
        }
    }

    fn validate(&self, errors: &mut Vec<String>) {
        match *self {
            Beta2Schedule::Constant(beta) => {
                if !(0.0..1.0).contains(&beta) {
                    errors.push(format!("beta2 ({}) must be in [0, 1)", beta));
                }
            }
            Beta2Schedule::Palm { scale } => {
                if !(scale > 0.0 && scale.is_finite()) {
                    errors.push(format!("beta2 scale ({}) must be finite and > 0", scale));
                }
            }
        }
    }
}

fn validate_common(
    lr: f64,
    beta1: f64,
    beta2: &Beta2Schedule,
    eps: f64,
    weight_decay: f64,
    errors: &mut Vec<String>,
) {
    if !(lr >= 0.0 && lr.is_finite()) {
        errors.push(format!("learning rate ({}) must be finite and >= 0", lr));
    }
    if !(0.0..1.0).contains(&beta1) {
        errors.push(format!("beta1 ({}) must be in [0, 1)", beta1));
    }
    beta2.validate(errors);
    if !(eps >= 0.0 && eps.is_finite()) {
        errors.push(format!("eps ({}) must be finite and >= 0", eps));
    }
    if !(weight_decay >= 0.0 && weight_decay.is_finite()) {
        errors.push(format!("weight_decay ({}) must be finite and >= 0", weight_decay));
    }
}

fn into_config_error(result: Result<(), Vec<String>>) -> PrecondResult<()> {
    result.map_err(|errors| PrecondError::Config(errors.join("; ")))
}

/// SOAP hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoapConfig {
    #[serde(default = "default_soap_lr")]
    pub lr: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default)]
    pub beta2: Beta2Schedule,
    /// Gram EMA decay; `None` reuses the step's debiased β₂.
    #[serde(default = "default_shampoo_beta")]
    pub shampoo_beta: Option<f64>,
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default = "default_soap_weight_decay")]
    pub weight_decay: f64,
    #[serde(default)]
    pub warmup_steps: u64,
    /// Axes above this size keep an identity factor.
    #[serde(default = "default_max_precond_dim")]
    pub max_precond_dim: usize,
    #[serde(default = "default_soap_refresh")]
    pub refresh: RefreshPolicy,
    #[serde(default = "default_true")]
    pub merge_dims: bool,
    #[serde(default)]
    pub precondition_1d: bool,
    #[serde(default)]
    pub memory_save_mode: Option<MemorySaveMode>,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for SoapConfig {
    fn default() -> Self {
        Self {
            lr: default_soap_lr(),
            beta1: default_beta1(),
            beta2: Beta2Schedule::default(),
            shampoo_beta: default_shampoo_beta(),
            eps: default_eps(),
            weight_decay: default_soap_weight_decay(),
            warmup_steps: 0,
            max_precond_dim: default_max_precond_dim(),
            refresh: default_soap_refresh(),
            merge_dims: true,
            precondition_1d: false,
            memory_save_mode: None,
            seed: default_seed(),
        }
    }
}

impl SoapConfig {
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_betas(mut self, beta1: f64, beta2: Beta2Schedule) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_shampoo_beta(mut self, shampoo_beta: Option<f64>) -> Self {
        self.shampoo_beta = shampoo_beta;
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
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

    pub fn with_max_precond_dim(mut self, max_precond_dim: usize) -> Self {
        self.max_precond_dim = max_precond_dim;
        self
    }

    pub fn with_refresh(mut self, refresh: RefreshPolicy) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn with_merge_dims(mut self, merge_dims: bool) -> Self {
        self.merge_dims = merge_dims;
        self
    }

    pub fn with_precondition_1d(mut self, precondition_1d: bool) -> Self {
        self.precondition_1d = precondition_1d;
        self
    }

    pub fn with_memory_save_mode(mut self, mode: Option<MemorySaveMode>) -> Self {
        self.memory_save_mode = mode;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Validate hyperparameters, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        validate_common(
            self.lr,
            self.beta1,
            &self.beta2,
            self.eps,
            self.weight_decay,
            &mut errors,
        );

        if let Some(beta) = self.shampoo_beta {
            if !(0.0..1.0).contains(&beta) {
                errors.push(format!("shampoo_beta ({}) must be in [0, 1)", beta));
            }
        }

        if self.max_precond_dim == 0 {
            errors.push("max_precond_dim must be greater than 0".to_string());
        }

        self.refresh.validate(&mut errors);

        if self.max_precond_dim > 8192 {
            warnings.push(format!(
                "max_precond_dim ({}) is large, eigendecompositions will be slow",
                self.max_precond_dim
            ));
        }

        if self.eps == 0.0 {
            warnings.push("eps is 0, zero second moments will divide by zero".to_string());
        }

        for warning in &warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub(crate) fn check(&self) -> PrecondResult<()> {
        into_config_error(self.validate())
    }
}

/// PSGD Kronecker hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsgdConfig {
    #[serde(default = "default_psgd_lr")]
    pub lr: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default)]
    pub beta2: Beta2Schedule,
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub warmup_steps: u64,
    /// Axes above this size get a diagonal factor. Also the merge bound.
    #[serde(default = "default_max_precond_dim")]
    pub max_size_triangular: usize,
    /// Parameters with fewer merged axes than this are fully diagonal.
    #[serde(default = "default_min_ndim_triangular")]
    pub min_ndim_triangular: usize,
    #[serde(default)]
    pub memory_save_mode: Option<MemorySaveMode>,
    #[serde(default = "default_psgd_refresh")]
    pub refresh: RefreshPolicy,
    #[serde(default = "default_precond_lr")]
    pub precond_lr: f64,
    #[serde(default = "default_precond_init_scale")]
    pub precond_init_scale: f64,
    /// Chance of rebalancing factor norms on a refresh step.
    #[serde(default = "default_balance_prob")]
    pub balance_prob: f64,
    #[serde(default = "default_true")]
    pub merge_dims: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for PsgdConfig {
    fn default() -> Self {
        Self {
            lr: default_psgd_lr(),
            beta1: default_beta1(),
            beta2: Beta2Schedule::default(),
            eps: default_eps(),
            weight_decay: 0.0,
            warmup_steps: 0,
            max_size_triangular: default_max_precond_dim(),
            min_ndim_triangular: default_min_ndim_triangular(),
            memory_save_mode: None,
            refresh: default_psgd_refresh(),
            precond_lr: default_precond_lr(),
            precond_init_scale: default_precond_init_scale(),
            balance_prob: default_balance_prob(),
            merge_dims: true,
            seed: default_seed(),
        }
    }
}

impl PsgdConfig {
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_betas(mut self, beta1: f64, beta2: Beta2Schedule) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
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

    pub fn with_max_size_triangular(mut self, max_size: usize) -> Self {
        self.max_size_triangular = max_size;
        self
    }

    pub fn with_min_ndim_triangular(mut self, min_ndim: usize) -> Self {
        self.min_ndim_triangular = min_ndim;
        self
    }

    pub fn with_memory_save_mode(mut self, mode: Option<MemorySaveMode>) -> Self {
        self.memory_save_mode = mode;
        self
    }

    pub fn with_refresh(mut self, refresh: RefreshPolicy) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn with_precond_lr(mut self, precond_lr: f64) -> Self {
        self.precond_lr = precond_lr;
        self
    }

    pub fn with_precond_init_scale(mut self, scale: f64) -> Self {
        self.precond_init_scale = scale;
        self
    }

    pub fn with_balance_prob(mut self, balance_prob: f64) -> Self {
        self.balance_prob = balance_prob;
        self
    }

    pub fn with_merge_dims(mut self, merge_dims: bool) -> Self {
        self.merge_dims = merge_dims;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Validate hyperparameters, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        validate_common(
            self.lr,
            self.beta1,
            &self.beta2,
            self.eps,
            self.weight_decay,
            &mut errors,
        );

        if self.max_size_triangular == 0 {
            errors.push("max_size_triangular must be greater than 0".to_string());
        }

        if !(self.precond_lr > 0.0 && self.precond_lr.is_finite()) {
            errors.push(format!(
                "precond_lr ({}) must be finite and > 0",
                self.precond_lr
            ));
        }

        if !(self.precond_init_scale > 0.0 && self.precond_init_scale.is_finite()) {
            errors.push(format!(
                "precond_init_scale ({}) must be finite and > 0",
                self.precond_init_scale
            ));
        }

        if !(0.0..=1.0).contains(&self.balance_prob) {
            errors.push(format!(
                "balance_prob ({}) must be in [0, 1]",
                self.balance_prob
            ));
        }

        self.refresh.validate(&mut errors);

        if self.precond_lr > 1.0 {
            warnings.push(format!(
                "precond_lr ({}) > 1, factor updates may oscillate",
                self.precond_lr
            ));
        }

        for warning in &warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub(crate) fn check(&self) -> PrecondResult<()> {
        into_config_error(self.validate())
    }
}
