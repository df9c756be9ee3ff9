use std::time::Duration;
use thiserror::Error;

/// Failures raised by the supervision framework itself.
///
/// These travel inside `anyhow::Error`; match them with
/// `err.downcast_ref::<SupervisorError>()`.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("circuit '{operation}' is open; retry in {}ms", retry_after.as_millis())]
    CircuitOpen {
        operation: String,
        retry_after: Duration,
    },

    #[error("alternative action '{0}' is already registered")]
    DuplicateAction(String),

    #[error("cycle exceeded watchdog timeout after {}ms", elapsed.as_millis())]
    WatchdogTimeout { elapsed: Duration },
}

impl SupervisorError {
    pub fn is_circuit_open(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<SupervisorError>(),
            Some(SupervisorError::CircuitOpen { .. })
        )
    }
}

/// An error carrying an explicit kind name such as `"ConnectionError"`.
///
/// Cycle bodies use it when the underlying failure has no richer Rust type;
/// the classifier matches on `kind`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct OperationError {
    pub kind: String,
    pub message: String,
}

impl OperationError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}
