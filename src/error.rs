use crate::types::FeatureStatus;

/// Error enum for scheduler operations and their collaborators.
///
/// Categories:
/// - Rejection: the caller asked for something the current state forbids
///   (`AlreadyRunning`, `NotFound`, `InvalidTransition`). Nothing changed.
/// - Executor: the external run raised instead of returning a result.
/// - Infrastructure: storage, git, config, or the coordinator task itself.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FgError {
    // Rejection
    #[error("Already running: {0}")]
    AlreadyRunning(String),

    #[error("Feature not found: {0}")]
    NotFound(String),

    #[error("Cannot {action} {id} while it is {from}")]
    InvalidTransition {
        id: String,
        from: FeatureStatus,
        action: &'static str,
    },

    // Executor
    #[error("Executor failed: {0}")]
    ExecutorFailure(String),

    // Infrastructure
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),
}

impl FgError {
    /// Returns true if the operation was refused without touching any state.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            FgError::AlreadyRunning(_) | FgError::NotFound(_) | FgError::InvalidTransition { .. }
        )
    }

    /// Returns true if the error comes from the executor rather than the core.
    pub fn is_executor_failure(&self) -> bool {
        matches!(self, FgError::ExecutorFailure(_))
    }
}

/// Bridge for the CLI layer, which reports errors as plain strings.
impl From<FgError> for String {
    fn from(err: FgError) -> String {
        err.to_string()
    }
}

pub type Result<T> = std::result::Result<T, FgError>;
