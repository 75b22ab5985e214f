//! Error taxonomy for the execution engine.
//!
//! Every failure a backend can report carries a typed [`ErrorKind`]. Retry,
//! circuit-breaker and fallback decisions are made on the kind alone; the
//! free-text message is for humans only.
//!
//! ## Kinds
//!
//! | Kind               | Transient | Typical source            |
//! |--------------------|-----------|---------------------------|
//! | `timeout`          | yes       | call exceeded its timeout |
//! | `rate_limit`       | yes       | provider throttling       |
//! | `server_error`     | yes       | 5xx / backend crash       |
//! | `connection_error` | yes       | DNS, refused, reset       |
//! | `validation_error` | no        | malformed request         |
//! | `auth_error`       | no        | bad or missing key        |
//! | `cancelled`        | no        | caller cancelled the task |

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resilience::ResourceKey;

/// Classifiable kind attached to every backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    RateLimit,
    ServerError,
    ConnectionError,
    ValidationError,
    AuthError,
    Cancelled,
}

impl ErrorKind {
    /// Whether a failure of this kind may succeed if simply tried again.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimit | Self::ServerError | Self::ConnectionError
        )
    }

    /// The transient kinds, used as the default retryable set.
    pub fn transient() -> &'static [ErrorKind] {
        &[
            Self::Timeout,
            Self::RateLimit,
            Self::ServerError,
            Self::ConnectionError,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::ConnectionError => "connection_error",
            Self::ValidationError => "validation_error",
            Self::AuthError => "auth_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a backend collaborator.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled by caller")
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Terminal outcome of running one backend through the retry executor.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// A non-retryable failure, surfaced on the attempt that produced it.
    #[error("backend failed: {0}")]
    Backend(BackendError),

    /// Every allowed attempt failed with a retryable error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: BackendError },

    /// The circuit for this resource refused the call. Not a backend error.
    #[error("circuit open for '{key}'")]
    CircuitOpen { key: ResourceKey },

    /// The caller's cancellation token fired.
    #[error("cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Kind of the underlying backend failure, if there was one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Backend(e) => Some(e.kind),
            Self::RetryExhausted { last, .. } => Some(last.kind),
            Self::CircuitOpen { .. } => None,
            Self::Cancelled => Some(ErrorKind::Cancelled),
        }
    }
}

/// Invalid configuration, detected before any task runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Tier '{tier}' references unknown backend '{backend}'")]
    UnknownBackend { tier: String, backend: String },
}

impl ConfigError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Hard failures surfaced by the engine to its caller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Every tier degraded and no terminal default payload exists.
    #[error("task '{task_id}' produced no usable output on any tier")]
    NoUsableOutput { task_id: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result alias for engine-level operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        for kind in ErrorKind::transient() {
            assert!(kind.is_transient(), "{kind} should be transient");
        }
        assert!(!ErrorKind::ValidationError.is_transient());
        assert!(!ErrorKind::AuthError.is_transient());
        assert!(!ErrorKind::Cancelled.is_transient());
    }

    #[test]
    fn test_error_kind_serde_is_snake_case() {
        let json = serde_json::to_string(&ErrorKind::RateLimit).unwrap();
        assert_eq!(json, "\"rate_limit\"");
        let parsed: ErrorKind = serde_json::from_str("\"auth_error\"").unwrap();
        assert_eq!(parsed, ErrorKind::AuthError);
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::new(ErrorKind::ServerError, "502 from upstream");
        assert_eq!(err.to_string(), "server_error: 502 from upstream");
    }

    #[test]
    fn test_execution_error_kind() {
        let exhausted = ExecutionError::RetryExhausted {
            attempts: 3,
            last: BackendError::timeout("slow"),
        };
        assert_eq!(exhausted.kind(), Some(ErrorKind::Timeout));
        assert_eq!(
            ExecutionError::CircuitOpen {
                key: ResourceKey::new("openai:mini")
            }
            .kind(),
            None
        );
        assert!(ExecutionError::Cancelled.is_cancelled());
    }
}
