//! Failure classes the batch runner has to tell apart.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to read input {path:?}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("Failed to load model {model}: {reason}")]
    ModelLoad { model: String, reason: String },

    #[error("Failed to write output {path:?}: {reason}")]
    Encode { path: PathBuf, reason: String },

    #[error("Unsupported input type: {0:?}")]
    Unsupported(PathBuf),
}

impl PipelineError {
    pub fn unreadable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Unreadable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn encode(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Encode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// A model that fails to load takes the whole run down with it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ModelLoad { .. })
    }
}

/// Returns true when an `anyhow` error chain carries a fatal `PipelineError`.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<PipelineError>())
        .any(PipelineError::is_fatal)
}
