//! Subscriber setup and step-level summaries.
//!
//! The engines emit `debug!` events on refreshes and state creation and
//! `warn!` events on skipped refreshes; nothing is printed until a
//! subscriber is installed.

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::state::RefreshStats;

/// Skip fraction above which a summary is logged as a warning.
pub const SKIP_WARN_RATIO: f64 = 0.1;

/// Engines log a refresh summary every this many optimizer steps.
pub const SUMMARY_INTERVAL: u64 = 100;

/// JSON logs, level from `RUST_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already set.
pub fn init_logging() {
    let installed = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kron_precond=info,kron_optim=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .is_ok();

    if installed {
        info!("Structured logging initialized");
    }
}

/// Human-readable logs for local runs and tests.
pub fn init_console_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kron_precond=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().pretty())
        .try_init();
}

/// Log accumulated refresh counters after `step` optimizer steps.
pub fn log_refresh_summary(engine: &str, step: u64, stats: &RefreshStats) {
    let attempts = stats.refreshes + stats.skipped;
    let skip_ratio = if attempts == 0 {
        0.0
    } else {
        stats.skipped as f64 / attempts as f64
    };

    if skip_ratio > SKIP_WARN_RATIO {
        warn!(
            engine,
            step,
            refreshes = stats.refreshes,
            skipped = stats.skipped,
            skip_ratio,
            event = "refresh_summary",
            "Many preconditioner refreshes skipped; gradients may contain NaN or Inf"
        );
    } else {
        info!(
            engine,
            step,
            refreshes = stats.refreshes,
            skipped = stats.skipped,
            balances = stats.balances,
            event = "refresh_summary",
            "Preconditioner refresh summary"
        );
    }
}
