//! Library Error Types
//!
//! Every fallible operation in the crate returns [`Result`]. Configuration
//! problems (unknown names, running tasks, bad dependency graphs) surface here
//! eagerly, before any task is started.

use thiserror::Error;

use crate::workflow::validator::ValidationError;

/// Errors produced by task, batch and workflow operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid workflow:\n{}", format_validation(.0))]
    Invalid(Vec<ValidationError>),

    #[error("unknown task names: {}", .0.join(", "))]
    UnknownTasks(Vec<String>),

    #[error("one or more tasks are already running: {}", .0.join(", "))]
    AlreadyRunning(Vec<String>),

    #[error("task '{task}' depends on '{dependency}', which has no run and is not scheduled")]
    MissingDependencyRun { task: String, dependency: String },

    #[error("malformed payload: {0}")]
    Payload(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("payload targets registry '{found}' but this runner serves '{expected}'")]
    RegistryMismatch { expected: String, found: String },
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by task functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tasks_display() {
        let err = Error::UnknownTasks(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "unknown task names: a, b");
    }

    #[test]
    fn test_invalid_lists_every_problem() {
        let err = Error::Invalid(vec![
            ValidationError::EmptyName,
            ValidationError::DuplicateName("x".to_string()),
        ]);
        let text = err.to_string();
        assert!(text.contains("empty"));
        assert!(text.contains("'x'"));
    }
}
