use thiserror::Error;
use ulid::Ulid;

use crate::model::{CivilDate, Ms};

/// Stable error classification surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    QuotaExceeded,
    NotFound,
    Authorization,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::Conflict => "conflict_error",
            ErrorKind::QuotaExceeded => "quota_exceeded_error",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::Authorization => "authorization_error",
            ErrorKind::Internal => "internal_error",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("unknown reservation type: {0}")]
    UnknownReservationType(Ulid),
    #[error("no availability on {0}")]
    NoAvailability(CivilDate),
    #[error("slot at {0} is not available")]
    SlotUnavailable(Ms),
    #[error("conflict with booking: {0}")]
    Conflict(Ulid),
    #[error("urgent request {0} is still pending")]
    UrgentRequestPending(Ulid),
    #[error("quota of {limit} active bookings reached")]
    QuotaExceeded { limit: u32 },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("booking {0} is already cancelled")]
    AlreadyCancelled(Ulid),
    #[error("booking {0} belongs to another user")]
    NotOwner(Ulid),
    #[error("WAL error: {0}")]
    Wal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_)
            | EngineError::LimitExceeded(_)
            | EngineError::AlreadyExists(_)
            | EngineError::UnknownReservationType(_) => ErrorKind::Validation,
            EngineError::NoAvailability(_)
            | EngineError::SlotUnavailable(_)
            | EngineError::Conflict(_)
            | EngineError::UrgentRequestPending(_) => ErrorKind::Conflict,
            EngineError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            EngineError::NotFound(_) | EngineError::AlreadyCancelled(_) => ErrorKind::NotFound,
            EngineError::NotOwner(_) => ErrorKind::Authorization,
            EngineError::Wal(_) => ErrorKind::Internal,
        }
    }
}
