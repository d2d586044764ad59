use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The requested time range overlaps an occupying booking.
    Conflict(Ulid),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot move booking from {} to {}", from.as_str(), to.as_str())
            }
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
