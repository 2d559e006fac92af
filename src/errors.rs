//! Typed error hierarchy for the Arcadia Forge orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — state store and event log failures
//! - `PolicyError` — security, autonomy, and validation denials
//! - `SupervisorError` — session lifecycle failures

use thiserror::Error;

/// Errors from the state store and event log.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open project store at {path}: {source}")]
    OpenFailed {
        path: std::path::PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Feature {index} not found")]
    FeatureNotFound { index: i64 },

    #[error("Feature {index} has no verification evidence")]
    MissingEvidence { index: i64 },

    #[error("Feature {index} is blocked by unfinished dependencies")]
    FeatureBlocked { index: i64 },

    #[error("Adding dependency {depends_on} -> {feature} would create a cycle")]
    DependencyCycle { feature: i64, depends_on: i64 },

    #[error("Session {id} not found")]
    SessionNotFound { id: i64 },

    #[error("Checkpoint {id} not found")]
    CheckpointNotFound { id: i64 },

    #[error("Injection point {id} not found or not pending")]
    InjectionNotPending { id: i64 },

    #[error("Another supervisor (pid {pid}) holds the project lock")]
    SupervisorLockHeld { pid: u32 },

    #[error("Event log write failed: {0}")]
    EventLogWrite(#[source] std::io::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Policy denials surfaced to the agent as structured tool errors.
/// These are never retried by the core.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Command blocked by security policy: {reason}")]
    SecurityDenied { reason: String },

    #[error("Action denied at autonomy level {effective}: requires level {required}")]
    AutonomyDenied { required: i64, effective: i64 },

    #[error("Approval request timed out and no default was configured")]
    ApprovalTimeout,

    #[error("Human rejected the action: {reason}")]
    ApprovalRejected { reason: String },
}

/// Errors from the session supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to checkpoint: {0}")]
    Checkpoint(#[source] anyhow::Error),

    #[error("Git workspace error: {0}")]
    Git(#[from] git2::Error),

    #[error("Agent runtime failed: {0}")]
    Runtime(#[source] anyhow::Error),

    #[error("Project configuration invalid: {0}")]
    Configuration(String),

    #[error("Crash recovery failed: {0}")]
    Recovery(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_evidence_carries_index() {
        let err = StoreError::MissingEvidence { index: 5 };
        assert!(err.to_string().contains('5'));
        assert!(matches!(err, StoreError::MissingEvidence { index: 5 }));
    }

    #[test]
    fn policy_errors_format_reason() {
        let err = PolicyError::SecurityDenied {
            reason: "rm is not allowed".into(),
        };
        assert!(err.to_string().contains("rm is not allowed"));
    }

    #[test]
    fn supervisor_error_converts_from_store_error() {
        let inner = StoreError::SessionNotFound { id: 3 };
        let sup: SupervisorError = inner.into();
        match &sup {
            SupervisorError::Store(StoreError::SessionNotFound { id }) => assert_eq!(*id, 3),
            _ => panic!("Expected Store(SessionNotFound)"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::LockPoisoned);
        assert_std_error(&PolicyError::ApprovalTimeout);
        assert_std_error(&SupervisorError::Configuration("bad".into()));
    }
}
