//! Error types for the preconditioner engine.
//!
//! Configuration and shape problems surface to the caller immediately.
//! Numerical trouble during a basis refresh never shows up here: the solver
//! keeps the previous basis and records the skip in `RefreshStats`.

use thiserror::Error;

use crate::state::ParamId;

/// Main error type for preconditioner operations
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum PrecondError {
    /// Errors from the candle tensor library
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// Invalid hyperparameters, raised before any step runs
    #[error("Configuration error: {0}")]
    Config(String),

    /// Gradient shape differs from the shape recorded for the parameter
    #[error("Shape mismatch for parameter {param}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        param: ParamId,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Operation not allowed in the optimizer's current mode
    #[error("Mode error: {0}")]
    Mode(String),

    /// Snapshot save/load failures
    #[error("Checkpoint error at '{path}': {message}")]
    Checkpoint { message: String, path: String },

    /// I/O errors with path context
    #[error("IO error at '{path}': {message}")]
    Io { message: String, path: String },
}

/// Result type alias for preconditioner operations
pub type PrecondResult<T> = std::result::Result<T, PrecondError>;

impl PrecondError {
    /// Shape and mode errors are caller bugs; everything else may be retried
    /// after fixing the environment (disk, config file).
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            PrecondError::ShapeMismatch { .. } | PrecondError::Mode(_)
        )
    }

    /// Get the path associated with this error (if any)
    pub fn path(&self) -> Option<&str> {
        match self {
            PrecondError::Checkpoint { path, .. } => Some(path),
            PrecondError::Io { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for PrecondError {
    fn from(err: candle_core::Error) -> Self {
        PrecondError::Tensor(err.to_string())
    }
}

impl From<std::io::Error> for PrecondError {
    fn from(err: std::io::Error) -> Self {
        PrecondError::Io {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

/// Helper trait for adding path context to IO operations
pub trait IoResultExt<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> PrecondResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> PrecondResult<T> {
        self.map_err(|e| PrecondError::Io {
            message: e.to_string(),
            path: path.as_ref().display().to_string(),
        })
    }
}

/// Helper for creating checkpoint errors
pub fn checkpoint_error<P: AsRef<std::path::Path>>(
    message: impl Into<String>,
    path: P,
) -> PrecondError {
    PrecondError::Checkpoint {
        message: message.into(),
        path: path.as_ref().display().to_string(),
    }
}

/// Helper for creating config errors
pub fn config_error(message: impl Into<String>) -> PrecondError {
    PrecondError::Config(message.into())
}

/// Helper for creating mode errors
pub fn mode_error(message: impl Into<String>) -> PrecondError {
    PrecondError::Mode(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_errors() {
        let err = PrecondError::ShapeMismatch {
            param: ParamId(3),
            expected: vec![4, 4],
            got: vec![4, 5],
        };
        assert!(err.is_caller_error());
        assert!(mode_error("not in train mode").is_caller_error());
        assert!(!config_error("lr must be >= 0").is_caller_error());
    }

    #[test]
    fn test_shape_mismatch_message() {
        let err = PrecondError::ShapeMismatch {
            param: ParamId(7),
            expected: vec![8, 8],
            got: vec![8],
        };
        let msg = err.to_string();
        assert!(msg.contains("param#7"), "{msg}");
        assert!(msg.contains("[8, 8]"), "{msg}");
    }

    #[test]
    fn test_tensor_error_conversion() {
        let candle_err = candle_core::Error::Msg("bad layout".to_string());
        let err: PrecondError = candle_err.into();
        assert!(matches!(err, PrecondError::Tensor(ref m) if m.contains("bad layout")));
    }

    #[test]
    fn test_path_extraction() {
        let err = checkpoint_error("truncated", "/tmp/precond.json");
        assert_eq!(err.path(), Some("/tmp/precond.json"));
        assert_eq!(config_error("x").path(), None);
    }

    #[test]
    fn test_io_with_path() {
        let result: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));
        match result.with_path("/tmp/missing.json") {
            Err(PrecondError::Io { path, .. }) => assert_eq!(path, "/tmp/missing.json"),
            other => panic!("Expected IO error with path, got {:?}", other),
        }
    }
}
