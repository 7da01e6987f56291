//! Errors raised by the pure domain layer.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// A deterministic refusal by the domain model: no I/O failure ever lands here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A counter or bookkeeping rule would be broken (e.g. more outcomes than recipients).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A message or campaign state machine refused the move.
    #[error("cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// A textual id did not parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_transition(from: impl core::fmt::Display, to: impl core::fmt::Display) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
