//! Engine snapshot save/load.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{checkpoint_error, IoResultExt, PrecondResult};
use crate::schedule::SchedulerSnapshot;
use crate::state::ParameterSnapshot;

/// Which engine produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Soap,
    Psgd,
}

/// Position of a ChaCha stream.
///
/// The word position is a `u128`, kept as a decimal string so JSON readers
/// without 128-bit integers can load it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngSnapshot {
    pub seed: u64,
    pub stream: u64,
    pub word_pos: String,
}

/// Everything needed to resume an engine bit for bit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub engine: EngineKind,
    /// Optimizer steps taken.
    pub step: u64,
    pub scheduler: SchedulerSnapshot,
    #[serde(default)]
    pub probe_rng: Option<RngSnapshot>,
    pub params: Vec<ParameterSnapshot>,
}

/// Write `snapshot` as JSON, creating parent directories.
pub fn save_snapshot<P: AsRef<Path>>(path: P, snapshot: &EngineSnapshot) -> PrecondResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_path(parent)?;
    }
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| checkpoint_error(format!("serialize failed: {}", e), path))?;
    std::fs::write(path, json).with_path(path)?;

    info!(
        path = %path.display(),
        step = snapshot.step,
        params = snapshot.params.len(),
        event = "snapshot_saved",
        "Preconditioner snapshot saved"
    );
    Ok(())
}

pub fn load_snapshot<P: AsRef<Path>>(path: P) -> PrecondResult<EngineSnapshot> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).with_path(path)?;
    serde_json::from_str(&json).map_err(|e| checkpoint_error(format!("parse failed: {}", e), path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PrecondError;
    use crate::schedule::{ProbabilitySchedule, RefreshPolicy};

    fn empty_snapshot() -> EngineSnapshot {
        EngineSnapshot {
            engine: EngineKind::Psgd,
            step: 12,
            scheduler: SchedulerSnapshot {
                policy: RefreshPolicy::Probability(ProbabilitySchedule::default()),
                seed: 7,
                draws: 12,
            },
            probe_rng: Some(RngSnapshot {
                seed: 7,
                stream: 1,
                word_pos: u128::MAX.to_string(),
            }),
            params: Vec::new(),
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("precond.json");
        let snap = empty_snapshot();
        save_snapshot(&path, &snap).unwrap();
        assert!(path.exists());
        let loaded = load_snapshot(&path).unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        match load_snapshot(&path) {
            Err(PrecondError::Io { path: p, .. }) => assert!(p.ends_with("absent.json")),
            other => panic!("expected IO error, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_file_is_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            load_snapshot(&path),
            Err(PrecondError::Checkpoint { .. })
        ));
    }
}
