//! Error taxonomy for the protocol handler.
//!
//! Admission outcomes (throttled, halted, disabled) are not errors; they are
//! regular responses. What remains here either rejects a request without
//! touching state or reports that the store could not serve it.

use fleet_rollout::LifecycleError;
use fleet_state::StateError;
use thiserror::Error;

pub type HandlerResult<T> = Result<T, HandlerError>;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unexpected event: {0}")]
    UnexpectedEvent(String),

    /// Concurrent writers kept winning; the device should retry later.
    #[error("transient conflict: {0}")]
    Transient(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

impl From<StateError> for HandlerError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Conflict(msg) => HandlerError::Transient(msg),
            StateError::NotFound(msg) => HandlerError::NotFound(msg),
            other => HandlerError::Unavailable(other.to_string()),
        }
    }
}

impl From<LifecycleError> for HandlerError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::UnexpectedEvent { .. } => HandlerError::UnexpectedEvent(e.to_string()),
            LifecycleError::UnknownEvent(_) | LifecycleError::UnknownResult(_) => {
                HandlerError::Malformed(e.to_string())
            }
        }
    }
}
