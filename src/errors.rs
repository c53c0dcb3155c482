//! Typed error taxonomy shared across the server.
//!
//! Components return these kinds so the HTTP layer can map them to status
//! codes without inspecting strings. Errors that a component can recover
//! from locally (a missing artifact file, one slow subscriber) never reach
//! this level.

use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is not initialized")]
    Unavailable,

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Errors from the execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("command must not be empty")]
    EmptyCommand,

    #[error("too many active executions (limit {limit})")]
    Overloaded { limit: usize },

    #[error("execution {id} not found")]
    NotFound { id: String },

    #[error("execution {id} is already {status}")]
    AlreadyTerminal { id: String, status: String },

    #[error("failed to spawn child process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Stable machine-readable codes carried on every error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Validation,
    NotFound,
    Conflict,
    StoreUnavailable,
    Io,
    ChildProcess,
    Overloaded,
    Timeout,
    Unauthorized,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::StoreUnavailable => "store_unavailable",
            Self::Io => "io_error",
            Self::ChildProcess => "child_process_error",
            Self::Overloaded => "overloaded",
            Self::Timeout => "timeout",
            Self::Unauthorized => "unauthorized",
            Self::Internal => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_not_found_carries_kind_and_id() {
        let err = StoreError::not_found("execution", "abc");
        match &err {
            StoreError::NotFound { kind, id } => {
                assert_eq!(*kind, "execution");
                assert_eq!(id, "abc");
            }
            _ => panic!("Expected NotFound"),
        }
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn engine_error_overloaded_names_limit() {
        let err = EngineError::Overloaded { limit: 500 };
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn engine_error_wraps_store_error() {
        let inner = StoreError::Unavailable;
        let err: EngineError = inner.into();
        assert!(matches!(err, EngineError::Store(StoreError::Unavailable)));
    }

    #[test]
    fn error_codes_are_stable_strings() {
        assert_eq!(ErrorCode::Validation.as_str(), "validation_error");
        assert_eq!(ErrorCode::Overloaded.as_str(), "overloaded");
        assert_eq!(ErrorCode::ChildProcess.as_str(), "child_process_error");
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::Unavailable);
        assert_std_error(&EngineError::EmptyCommand);
    }
}
