/// Error taxonomy shared by every orchestrator.
///
/// Component-local failures are absorbed into bundle/report status by the
/// orchestrators; everything that reaches a caller is an [`OpsError`]. Errors raised
/// inside a state machine are wrapped in [`OpsError::StepFailed`] so the report
/// always names the step and the affected entity.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, OpsError>;

/// Exit code for validation and precondition failures
pub const EXIT_PRECONDITION: u8 = 1;

/// Exit code for failures that happened mid-flight
pub const EXIT_OPERATION: u8 = 2;

#[derive(Error, Debug)]
pub enum OpsError {
    /// Missing configuration, invalid input, unknown environment
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// A dependency the operation needs is not reachable
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Bundle not found: {0}")]
    BundleNotFound(String),

    #[error("Bundle {bundle_id} is corrupt: {reason}")]
    BundleCorrupt { bundle_id: String, reason: String },

    /// A destructive step was invoked without an explicit confirmation token
    #[error("Confirmation required: {0}")]
    ConfirmationRequired(String),

    #[error("A migration is already in flight (lock held by {holder})")]
    MigrationInFlight { holder: String },

    #[error("{step} timed out after {after:?}")]
    Timeout { step: String, after: Duration },

    #[error("Storage error: {message}")]
    Storage { message: String, transient: bool },

    #[error("Storage authorization failed: {0}")]
    StorageAuth(String),

    #[error("Storage object not found: {0}")]
    NotFound(String),

    #[error("Partial failure: {0}")]
    PartialFailure(String),

    #[error("Backup {bundle_id} failed: {reason}")]
    BackupFailed { bundle_id: String, reason: String },

    #[error("Migration stopped at revision {revision} after {applied} applied step(s): {reason}")]
    MigrationFailed {
        revision: String,
        applied: usize,
        reason: String,
    },

    #[error("Command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An orchestrator step failed; `source` holds the underlying error
    #[error("{step} failed for {entity}: {source}")]
    StepFailed {
        step: String,
        entity: String,
        manual_recovery: bool,
        source: Box<OpsError>,
    },
}

impl OpsError {
    pub fn storage(message: impl Into<String>) -> Self {
        OpsError::Storage {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient_storage(message: impl Into<String>) -> Self {
        OpsError::Storage {
            message: message.into(),
            transient: true,
        }
    }

    /// Wrap this error with the state-machine step and entity it occurred at
    pub fn at_step(
        self,
        step: impl Into<String>,
        entity: impl Into<String>,
        manual_recovery: bool,
    ) -> Self {
        OpsError::StepFailed {
            step: step.into(),
            entity: entity.into(),
            manual_recovery,
            source: Box::new(self),
        }
    }

    /// The innermost error below any step wrappers
    pub fn root(&self) -> &OpsError {
        match self {
            OpsError::StepFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// The outermost step this error was raised at, if any
    pub fn step(&self) -> Option<&str> {
        match self {
            OpsError::StepFailed { step, .. } => Some(step.as_str()),
            _ => None,
        }
    }

    pub fn requires_manual_recovery(&self) -> bool {
        match self {
            OpsError::StepFailed {
                manual_recovery,
                source,
                ..
            } => *manual_recovery || source.requires_manual_recovery(),
            OpsError::MigrationFailed { applied, .. } => *applied > 0,
            _ => false,
        }
    }

    /// Only transient storage errors are retried; authorization errors never are
    pub fn is_transient(&self) -> bool {
        matches!(self, OpsError::Storage { transient: true, .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            OpsError::NotFound(_) | OpsError::BundleNotFound(_)
        )
    }

    /// Process exit code: 1 for validation/precondition failures, 2 for failures
    /// that happened while the operation was running
    pub fn exit_code(&self) -> u8 {
        match self.root() {
            OpsError::PreconditionFailed(_)
            | OpsError::ServiceUnavailable(_)
            | OpsError::BundleNotFound(_)
            | OpsError::BundleCorrupt { .. }
            | OpsError::ConfirmationRequired(_)
            | OpsError::MigrationInFlight { .. } => EXIT_PRECONDITION,
            _ => EXIT_OPERATION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_wrapping_keeps_root() {
        let err = OpsError::ConfirmationRequired("drop database".into()).at_step(
            "DatabaseRestoring",
            "20260101T000000000Z",
            true,
        );

        assert_eq!(err.step(), Some("DatabaseRestoring"));
        assert!(matches!(err.root(), OpsError::ConfirmationRequired(_)));
        assert!(err.requires_manual_recovery());
        assert_eq!(err.exit_code(), EXIT_PRECONDITION);
        assert!(err.to_string().contains("DatabaseRestoring failed for 20260101T000000000Z"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(OpsError::PreconditionFailed("x".into()).exit_code(), 1);
        assert_eq!(OpsError::MigrationInFlight { holder: "a".into() }.exit_code(), 1);
        assert_eq!(OpsError::storage("disk full").exit_code(), 2);
        assert_eq!(
            OpsError::Timeout {
                step: "capture".into(),
                after: Duration::from_secs(1)
            }
            .exit_code(),
            2
        );
    }

    #[test]
    fn test_only_transient_storage_errors_retry() {
        assert!(OpsError::transient_storage("connection reset").is_transient());
        assert!(!OpsError::storage("bad path").is_transient());
        assert!(!OpsError::StorageAuth("403".into()).is_transient());
    }
}
