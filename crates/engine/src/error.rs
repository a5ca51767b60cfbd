//! The module contains the errors the engine can throw.
//!
//! Business-rule failures are local and recoverable:
//!
//! - [`InsufficientBalance`] thrown when a conditional debit affected no rows.
//! - [`IdempotencyConflict`] thrown when an idempotency key is reused with a
//!   different payload.
//! - [`InvalidTransition`] thrown when a campaign lifecycle action is not
//!   allowed from its current status.
//!
//! Only [`Database`] is fatal: a unit of work that hits it is rolled back as
//! a whole.
//!
//!  [`InsufficientBalance`]: EngineError::InsufficientBalance
//!  [`IdempotencyConflict`]: EngineError::IdempotencyConflict
//!  [`InvalidTransition`]: EngineError::InvalidTransition
//!  [`Database`]: EngineError::Database
use sea_orm::DbErr;
use thiserror::Error;

/// Engine custom errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("Idempotency conflict: {0}")]
    IdempotencyConflict(String),
    #[error("\"{0}\" key not found!")]
    KeyNotFound(String),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Invalid campaign: {0}")]
    InvalidCampaign(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Invalid session: {0}")]
    InvalidSession(String),
    #[error("Invalid id: {0}")]
    InvalidId(String),
    #[error("Corrupted record: {0}")]
    Corrupted(String),
    #[error("Upstream telemetry unavailable: {0}")]
    UpstreamTelemetryUnavailable(String),
    #[error(transparent)]
    Database(#[from] DbErr),
}

impl PartialEq for EngineError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InsufficientBalance(a), Self::InsufficientBalance(b)) => a == b,
            (Self::IdempotencyConflict(a), Self::IdempotencyConflict(b)) => a == b,
            (Self::KeyNotFound(a), Self::KeyNotFound(b)) => a == b,
            (Self::InvalidAmount(a), Self::InvalidAmount(b)) => a == b,
            (Self::InvalidCampaign(a), Self::InvalidCampaign(b)) => a == b,
            (Self::InvalidTransition(a), Self::InvalidTransition(b)) => a == b,
            (Self::InvalidSession(a), Self::InvalidSession(b)) => a == b,
            (Self::InvalidId(a), Self::InvalidId(b)) => a == b,
            (Self::Corrupted(a), Self::Corrupted(b)) => a == b,
            (Self::UpstreamTelemetryUnavailable(a), Self::UpstreamTelemetryUnavailable(b)) => {
                a == b
            }
            (Self::Database(a), Self::Database(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}
