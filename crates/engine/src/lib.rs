//! Points ledger and campaign incentive engine for EV charging sessions.
//!
//! The `Engine` owns five components backed by one database:
//!
//! - the Account Store (`ops::accounts`): balances mutated through atomic
//!   conditional updates;
//! - the Ledger (`ops::ledger`): the append-only, idempotent transaction log;
//! - the Session Tracker (`ops::sessions`): the per-driver charging state
//!   machine fed by telemetry;
//! - the Campaign Registry (`ops::campaigns`): budgeted programs and their
//!   lifecycle;
//! - the Incentive Engine (`ops::incentives`): rewards finalized sessions
//!   out of campaign budgets.

pub use accounts::{Account, AccountKind, AccountRef};
pub use cache::{MemoryPollCache, PollCache};
pub use campaigns::{Campaign, CampaignStatus, DriverCaps, MAX_BUDGET_CENTS};
pub use collaborators::{
    Charger, ChargerDirectory, GrantNotifier, TelemetryError, TelemetryProvider, TelemetryReading,
};
pub use commands::{CampaignPatch, NewCampaignCmd, RecordCmd, TelemetrySnapshot, TxMeta};
pub use error::EngineError;
pub use grants::{GrantStatus, IncentiveGrant, clawback_idempotency_key, grant_idempotency_key};
pub use ops::{Engine, EngineBuilder, EngineConfig, Reconciliation};
pub use rules::{GeoCircle, RuleMismatch, SessionFacts, TargetingRules, TimeWindow, distance_m};
pub use sessions::{
    EndedReason, LocationPoint, PollStatus, QualityInputs, SessionEvent, quality_score,
};
pub use transactions::{Sides, Transaction, TransactionKind, fingerprint};

mod accounts;
mod cache;
mod campaigns;
mod collaborators;
mod commands;
mod error;
mod grants;
mod ops;
mod rules;
mod sessions;
mod transactions;
mod util;

pub type ResultEngine<T> = Result<T, EngineError>;
