//! # Kronecker-factored preconditioners
//!
//! Per-parameter preconditioning state for second-order optimizers that
//! factor the preconditioner along tensor axes.
//!
//! ## Architecture Overview
//!
//! - **Shape merging** ([`merge`]): adjacent axes are folded together up to
//!   a size bound, so each parameter is handled as a small stack of axes
//! - **Statistics** ([`gram`]): per-axis Gram matrices, exact or EMA-blended
//! - **Factors** ([`factor`], [`solver`]): SOAP eigenbases refreshed by QR
//!   power steps; PSGD triangular/diagonal whitening factors
//! - **Projection** ([`project`]): per-axis contractions in and out of the
//!   factored basis
//! - **Scheduling** ([`schedule`]): fixed-cadence or annealed-probability
//!   refresh gating from an owned, seeded generator
//! - **Engines** ([`soap`], [`psgd`]): atomic multi-parameter steps with
//!   snapshot/restore ([`checkpoint`])
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use candle_core::{Device, Tensor};
//! use kron_precond::{ParamId, SoapConfig, SoapPreconditioner};
//!
//! # fn main() -> kron_precond::PrecondResult<()> {
//! let mut soap = SoapPreconditioner::new(SoapConfig::default())?;
//! let grad = Tensor::randn(0f32, 1.0, (64, 32), &Device::Cpu)?;
//!
//! // The first step only builds statistics.
//! assert!(soap.step(&[(ParamId(0), grad.clone())])?[0].is_none());
//! let update = soap.step(&[(ParamId(0), grad)])?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod factor;
pub mod gram;
pub mod linalg;
pub mod logging;
pub mod merge;
pub mod moments;
pub mod project;
pub mod psgd;
pub mod schedule;
pub mod soap;
pub mod solver;
pub mod state;

pub use checkpoint::{load_snapshot, save_snapshot, EngineKind, EngineSnapshot, RngSnapshot};
pub use config::{Beta2Schedule, MemorySaveMode, PsgdConfig, SoapConfig};
pub use error::{PrecondError, PrecondResult};
pub use factor::{Factor, FactorKind};
pub use merge::{merge_shape, MergedLayout};
pub use project::Direction;
pub use psgd::PsgdPreconditioner;
pub use schedule::{ProbabilitySchedule, RefreshDecision, RefreshPolicy, UpdateScheduler};
pub use soap::SoapPreconditioner;
pub use state::{ParamId, ParameterState, RefreshStats, StateStore};
