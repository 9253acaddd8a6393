//! Error types for the executor engine.

use bespoke_core::{SubmissionId, TaskId};

/// The result type used throughout bespoke-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in executor operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A submission was not found.
    #[error("submission not found: {id}")]
    SubmissionNotFound {
        /// The submission id that was looked up.
        id: SubmissionId,
    },

    /// A task was not found.
    #[error("task not found: {id}")]
    TaskNotFound {
        /// The task id that was looked up.
        id: TaskId,
    },

    /// A submitted workflow failed validation.
    #[error("invalid workflow: {}", reasons.join("; "))]
    InvalidWorkflow {
        /// Each reason the document was rejected.
        reasons: Vec<String>,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// Why the transition is invalid.
        reason: String,
    },

    /// The queue backend is unreachable or misconfigured.
    #[error("queue unavailable: {message}")]
    QueueUnavailable {
        /// Description of the queue failure.
        message: String,
    },

    /// A lease was lost before the owner could publish.
    #[error("lease lost for fingerprint {fingerprint}")]
    LeaseLost {
        /// The fingerprint whose lease expired or changed owner.
        fingerprint: String,
    },

    /// A canonicalization failure while fingerprinting.
    #[error("fingerprint error: {0}")]
    Canonical(#[from] bespoke_core::canonical::CanonicalError),

    /// An error from the kernel (storage, serialization, ids).
    #[error("core error: {0}")]
    Core(#[from] bespoke_core::Error),

    /// Any unexpected condition; logged and surfaced without stack detail.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a workflow validation error from a list of reasons.
    #[must_use]
    pub fn invalid_workflow(reasons: Vec<String>) -> Self {
        Self::InvalidWorkflow { reasons }
    }

    /// Creates an internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_workflow_joins_reasons() {
        let err = Error::invalid_workflow(vec!["no smiles".into(), "no targets".into()]);
        let msg = err.to_string();
        assert!(msg.contains("no smiles"));
        assert!(msg.contains("no targets"));
    }

    #[test]
    fn state_transition_error_display() {
        let err = Error::InvalidStateTransition {
            from: "pending".into(),
            to: "succeeded".into(),
            reason: "must pass through in-flight".into(),
        };
        assert!(err.to_string().contains("pending -> succeeded"));
    }
}
