//! Error taxonomy for the lifecycle and retrieval core.
//!
//! A lost lease race is not an error; it is reported as
//! [`LeaseOutcome::Conflict`](crate::memory::lease::LeaseOutcome).

use thiserror::Error;

use crate::generation::GenerationError;
use crate::memory::types::Tier;

/// Errors surfaced by the memory core.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// A tier or promotion rule was violated. Caller error, never retried.
    #[error("invalid transition for {id} (tier {tier}): {reason}")]
    InvalidTransition {
        id: String,
        tier: Tier,
        reason: String,
    },

    /// The backing store failed an operation.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The text generator failed or returned unusable output.
    #[error("generation failure: {0}")]
    GenerationFailure(String),

    /// A similarity, threshold, weight, or limit was out of range.
    #[error("validation error: {0}")]
    Validation(String),

    /// No record exists under the given id.
    #[error("memory not found: {0}")]
    NotFound(String),
}

impl MemoryError {
    pub fn invalid_transition(id: &str, tier: Tier, reason: impl Into<String>) -> Self {
        Self::InvalidTransition {
            id: id.to_string(),
            tier,
            reason: reason.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::StoreUnavailable(format!("corrupt json column: {err}"))
    }
}

impl From<tokio::task::JoinError> for MemoryError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::StoreUnavailable(format!("blocking task failed: {err}"))
    }
}

impl From<GenerationError> for MemoryError {
    fn from(err: GenerationError) -> Self {
        Self::GenerationFailure(err.to_string())
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Reject a value outside `[0.0, 1.0]` (or NaN).
pub(crate) fn ensure_unit_interval(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(MemoryError::validation(format!(
            "{name} must be within [0.0, 1.0], got {value}"
        )));
    }
    Ok(())
}
