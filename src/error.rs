//! Core error taxonomy
//!
//! `AlreadyProcessed` and lost compare-and-set races are not errors here;
//! they surface as outcome variants on the operations that can hit them.

use serde::Serialize;

#[derive(Debug)]
pub enum CoreError {
    /// Malformed or missing input
    Validation(String),
    /// Referenced entity does not exist
    NotFound { entity: &'static str, id: String },
    /// A referenced sub-entity is missing or contradicts its parent
    InconsistentState(String),
    /// Ledger store could not complete the call; safe for the caller to retry
    StoreUnavailable(String),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::NotFound { .. } => ErrorKind::NotFound,
            CoreError::InconsistentState(_) => ErrorKind::InconsistentState,
            CoreError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::StoreUnavailable(_))
    }
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::Validation(msg) => write!(f, "validation failed: {}", msg),
            CoreError::NotFound { entity, id } => write!(f, "{} not found: {}", entity, id),
            CoreError::InconsistentState(msg) => write!(f, "inconsistent state: {}", msg),
            CoreError::StoreUnavailable(msg) => write!(f, "ledger store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            // unique / foreign key violations come from caller input, not the store
            Some(rusqlite::ErrorCode::ConstraintViolation) => {
                CoreError::Validation(format!("constraint violated: {}", e))
            }
            _ => CoreError::StoreUnavailable(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::StoreUnavailable(format!("corrupt stored document: {}", e))
    }
}

/// Wire-stable failure kinds for structured outcomes
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    InconsistentState,
    StoreUnavailable,
}
