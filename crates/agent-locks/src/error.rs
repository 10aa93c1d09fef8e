//! Lock service error types.

use miette::Diagnostic;
use thiserror::Error;

/// Stable code carried by the rejection delivered to a stolen lock's
/// released future.
pub const LOCK_STOLEN: &str = "LOCK_STOLEN";

/// Errors surfaced through lock settlement futures.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum LockError {
    /// The holder was evicted by a steal request.
    #[error("lock was stolen by a competing request")]
    #[diagnostic(code(agent_locks::stolen))]
    Stolen,

    /// The work callback reported a failure.
    #[error("lock work failed: {reason}")]
    #[diagnostic(code(agent_locks::work_failed))]
    WorkFailed { reason: String },

    /// The work callback (or the future it returned) panicked.
    #[error("lock work panicked: {reason}")]
    #[diagnostic(code(agent_locks::work_panicked))]
    WorkPanicked { reason: String },

    /// The owning agent was torn down before the lock settled.
    #[error("owning agent was torn down")]
    #[diagnostic(code(agent_locks::agent_gone))]
    AgentGone,

    /// A mode string was neither "shared" nor "exclusive".
    #[error("invalid lock mode '{mode}'")]
    #[diagnostic(code(agent_locks::invalid_mode))]
    InvalidMode { mode: String },
}

impl LockError {
    /// Shorthand for a work failure with the given reason.
    pub fn failed(reason: impl Into<String>) -> Self {
        LockError::WorkFailed {
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code for this error.
    pub const fn code(&self) -> &'static str {
        match self {
            LockError::Stolen => LOCK_STOLEN,
            LockError::WorkFailed { .. } => "WORK_FAILED",
            LockError::WorkPanicked { .. } => "WORK_PANICKED",
            LockError::AgentGone => "AGENT_GONE",
            LockError::InvalidMode { .. } => "INVALID_MODE",
        }
    }
}

/// Lock service result type alias.
pub type Result<T> = std::result::Result<T, LockError>;
