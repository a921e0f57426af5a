use postmortem_evidence::{ReasonError, StoreError};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorErrorKind {
    /// The command did not finish within its timeout
    Timeout,
    /// The debugger ran but the command failed
    Failed,
    /// The debugger could not be started or has gone away
    Unavailable,
}

/// A command that could not be run; treated as inconclusive evidence, never fatal
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct ExecutorError {
    pub kind: ExecutorErrorKind,
    pub message: String,
}

impl ExecutorError {
    pub fn new(kind: ExecutorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ExecutorErrorKind::Timeout, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ExecutorErrorKind::Failed, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ExecutorErrorKind::Unavailable, message)
    }
}

/// Structural failures that stop an investigation
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("every command of the round failed: {0}")]
    AllCommandsFailed(String),
    #[error("reasoning failure: {0}")]
    Reasoning(#[from] ReasonError),
}
