//! Typed errors at the seams callers need to branch on. Everything else
//! (provider failures, storage I/O) flows through `anyhow::Result` the way
//! the rest of this crate does.

use thiserror::Error;

/// Errors surfaced verbatim to an operator API caller.
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("rollback is not supported")]
    RollbackUnsupported,

    #[error("step '{0}' not found in run")]
    StepNotFound(String),

    #[error("cannot restart step '{0}': phase is {1:?}, expected Failed")]
    NotFailed(String, crate::model::StepPhase),

    #[error("run is terminated")]
    RunTerminated,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
