//! Error types for instance lifecycle management

use std::time::Duration;

use thiserror::Error;

/// Failures reported by the container runtime adapter.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The runtime does not know the instance.
    #[error("instance not found in runtime: {0}")]
    NotFound(String),

    /// The runtime command ran but exited unsuccessfully.
    #[error("runtime `{operation}` failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        operation: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    /// The runtime replied with something we could not interpret.
    #[error("unexpected output from runtime `{operation}`: {output:?}")]
    UnexpectedOutput {
        operation: &'static str,
        output: String,
    },

    #[error("failed to launch runtime command: {0}")]
    Spawn(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Failures while waiting for the helper to print a credential.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("credential capture timed out after {0:?}")]
    Timeout(Duration),

    #[error("helper output ended before a credential was printed")]
    StreamEnded,

    #[error("credential capture cancelled")]
    Cancelled,

    #[error("helper printed a credential that cannot be stored: {0}")]
    InvalidCredential(String),

    #[error("failed to launch credential helper: {0}")]
    Spawn(#[source] RuntimeError),

    #[error("failed to read helper output: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the instance registry store.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("instance id already registered: {0}")]
    DuplicateId(String),

    #[error("owner {owner} already holds {limit} instances")]
    QuotaFull { owner: String, limit: usize },

    #[error("instance id not registered: {0}")]
    NotPresent(String),

    #[error("no instance matches '{0}'")]
    NotFound(String),

    #[error("'{prefix}' matches {matches} instances, use a longer id")]
    AmbiguousId { prefix: String, matches: usize },

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupt settings: {0}")]
    Settings(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry lock poisoned")]
    Poisoned,
}

/// Outcome taxonomy of a lifecycle request.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("owner already has {limit} instances")]
    QuotaExceeded { owner: String, limit: usize },

    #[error("unknown image '{choice}' (available: {available})")]
    ImageUnknown { choice: String, available: String },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("no instance matches '{0}'")]
    NotFound(String),

    #[error("instance {0} no longer exists in the runtime, record removed")]
    StaleRecord(String),

    #[error("'{prefix}' matches {matches} instances, use a longer id")]
    AmbiguousId { prefix: String, matches: usize },

    #[error("instance {0} is not running")]
    NotRunning(String),

    #[error("deployment rolled back: {0}")]
    DeployIncomplete(#[source] CaptureError),

    #[error("credential regeneration failed: {0}")]
    RegenFailed(#[source] CaptureError),

    #[error("registry integrity violation: instance id {0} registered twice")]
    DuplicateId(String),

    #[error("registry integrity violation: {0}")]
    Integrity(String),

    #[error("registry error: {0}")]
    Registry(RegistryError),
}

impl From<RegistryError> for LifecycleError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateId(id) => Self::DuplicateId(id),
            RegistryError::QuotaFull { owner, limit } => Self::QuotaExceeded { owner, limit },
            RegistryError::NotFound(prefix) => Self::NotFound(prefix),
            RegistryError::AmbiguousId { prefix, matches } => Self::AmbiguousId { prefix, matches },
            RegistryError::NotPresent(id) => {
                Self::Integrity(format!("instance {} vanished while locked", id))
            }
            other => Self::Registry(other),
        }
    }
}

impl LifecycleError {
    /// Errors caused by the request itself rather than by the system.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded { .. }
                | Self::ImageUnknown { .. }
                | Self::NotFound(_)
                | Self::StaleRecord(_)
                | Self::AmbiguousId { .. }
                | Self::NotRunning(_)
        )
    }

    /// Errors that indicate a concurrency or storage bug.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::DuplicateId(_) | Self::Integrity(_))
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_errors_fold_into_lifecycle_taxonomy() {
        let err: LifecycleError = RegistryError::AmbiguousId {
            prefix: "c1".into(),
            matches: 2,
        }
        .into();
        assert!(matches!(err, LifecycleError::AmbiguousId { matches: 2, .. }));
        assert!(err.is_user_error());

        let err: LifecycleError = RegistryError::DuplicateId("abc".into()).into();
        assert!(err.is_invariant_violation());
        assert!(!err.is_user_error());

        let err: LifecycleError = RegistryError::NotPresent("abc".into()).into();
        assert!(err.is_invariant_violation());

        let err: LifecycleError = RegistryError::QuotaFull {
            owner: "alice".into(),
            limit: 12,
        }
        .into();
        assert!(matches!(err, LifecycleError::QuotaExceeded { limit: 12, .. }));
        assert!(err.is_user_error());
    }

    #[test]
    fn test_runtime_not_found_is_distinguished() {
        assert!(RuntimeError::NotFound("x".into()).is_not_found());
        let failed = RuntimeError::CommandFailed {
            operation: "stop",
            code: Some(1),
            stderr: "boom".into(),
        };
        assert!(!failed.is_not_found());
    }
}
