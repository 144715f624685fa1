use ulid::Ulid;

use crate::model::Day;

/// Caller-facing classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input. Never retried.
    Validation,
    NotFound,
    /// The requested state collides with committed state (e.g. double booking).
    Conflict,
    /// Storage failure. Details are logged, not surfaced.
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid range: {start} is after {end}")]
    InvalidRange { start: Day, end: Day },
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("interval already booked by contract {0}")]
    Conflict(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidRange { .. }
            | EngineError::Invalid(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_) | EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::WalError(_) => ErrorKind::Internal,
        }
    }
}
