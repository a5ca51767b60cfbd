//! Command structs for engine operations.
//!
//! These types group parameters for write operations (ledger records,
//! campaign creation/edits, telemetry polls), keeping call sites readable
//! and avoiding long argument lists.

use chrono::{DateTime, Utc};

use crate::{AccountRef, DriverCaps, TargetingRules, TransactionKind};

/// Common metadata for ledger writes.
#[derive(Clone, Debug, Default)]
pub struct TxMeta {
    pub idempotency_key: Option<String>,
    /// Caller-side reference (order id, session id); part of the fingerprint.
    pub correlation_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl TxMeta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Record a ledger transaction.
#[derive(Clone, Debug)]
pub struct RecordCmd {
    pub kind: TransactionKind,
    pub amount_cents: i64,
    pub source: Option<AccountRef>,
    pub destination: Option<AccountRef>,
    pub meta: TxMeta,
}

impl RecordCmd {
    #[must_use]
    pub fn new(kind: TransactionKind, amount_cents: i64) -> Self {
        Self {
            kind,
            amount_cents,
            source: None,
            destination: None,
            meta: TxMeta::new(),
        }
    }

    #[must_use]
    pub fn source(mut self, account: AccountRef) -> Self {
        self.source = Some(account);
        self
    }

    #[must_use]
    pub fn destination(mut self, account: AccountRef) -> Self {
        self.destination = Some(account);
        self
    }

    #[must_use]
    pub fn meta(mut self, meta: TxMeta) -> Self {
        self.meta = meta;
        self
    }

    #[must_use]
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.meta.idempotency_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.meta.correlation_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.meta.metadata = Some(metadata);
        self
    }
}

/// Create a campaign in `Draft`.
#[derive(Clone, Debug)]
pub struct NewCampaignCmd {
    pub name: String,
    pub sponsor_name: String,
    pub sponsor_ref: Option<String>,
    pub description: Option<String>,
    pub budget_cents: i64,
    pub cost_per_session_cents: i64,
    pub max_sessions: Option<i64>,
    pub priority: i32,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    /// IANA name; defaults to `UTC`.
    pub timezone: Option<String>,
    pub rules: TargetingRules,
    pub caps: DriverCaps,
}

impl NewCampaignCmd {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        sponsor_name: impl Into<String>,
        budget_cents: i64,
        cost_per_session_cents: i64,
        start_date: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            sponsor_name: sponsor_name.into(),
            sponsor_ref: None,
            description: None,
            budget_cents,
            cost_per_session_cents,
            max_sessions: None,
            priority: 100,
            start_date,
            end_date: None,
            timezone: None,
            rules: TargetingRules::default(),
            caps: DriverCaps::default(),
        }
    }

    #[must_use]
    pub fn sponsor_ref(mut self, sponsor_ref: impl Into<String>) -> Self {
        self.sponsor_ref = Some(sponsor_ref.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn max_sessions(mut self, max_sessions: i64) -> Self {
        self.max_sessions = Some(max_sessions);
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn end_date(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = Some(end_date);
        self
    }

    #[must_use]
    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    #[must_use]
    pub fn rules(mut self, rules: TargetingRules) -> Self {
        self.rules = rules;
        self
    }

    #[must_use]
    pub fn caps(mut self, caps: DriverCaps) -> Self {
        self.caps = caps;
        self
    }
}

/// Partial update of a `Draft` or `Paused` campaign.
///
/// `None` leaves a field as is. For nullable fields the inner `Option`
/// carries the new value (`Some(None)` clears it).
#[derive(Clone, Debug, Default)]
pub struct CampaignPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub sponsor_name: Option<String>,
    pub sponsor_ref: Option<Option<String>>,
    pub budget_cents: Option<i64>,
    pub cost_per_session_cents: Option<i64>,
    pub max_sessions: Option<Option<i64>>,
    pub priority: Option<i32>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<Option<DateTime<Utc>>>,
    pub timezone: Option<String>,
    pub rules: Option<TargetingRules>,
    pub caps: Option<DriverCaps>,
}

impl CampaignPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.sponsor_name.is_none()
            && self.sponsor_ref.is_none()
            && self.budget_cents.is_none()
            && self.cost_per_session_cents.is_none()
            && self.max_sessions.is_none()
            && self.priority.is_none()
            && self.start_date.is_none()
            && self.end_date.is_none()
            && self.timezone.is_none()
            && self.rules.is_none()
            && self.caps.is_none()
    }
}

/// One telemetry observation for a driver's vehicle.
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetrySnapshot {
    pub charging: bool,
    pub observed_at: DateTime<Utc>,
    pub vehicle_ref: Option<String>,
    /// Energy delivered so far in the current charge.
    pub energy_delivered_kwh: Option<f64>,
    pub power_kw: Option<f64>,
    pub battery_pct: Option<f64>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub connector_type: Option<String>,
    pub verification_source: String,
    pub verification_method: String,
    pub verified: bool,
    /// Upstream id of the session, unique per verification source.
    pub source_session_id: Option<String>,
}

impl TelemetrySnapshot {
    #[must_use]
    pub fn new(charging: bool, observed_at: DateTime<Utc>) -> Self {
        Self {
            charging,
            observed_at,
            vehicle_ref: None,
            energy_delivered_kwh: None,
            power_kw: None,
            battery_pct: None,
            lat: None,
            lng: None,
            connector_type: None,
            verification_source: "telemetry".to_string(),
            verification_method: "vehicle_poll".to_string(),
            verified: true,
            source_session_id: None,
        }
    }

    #[must_use]
    pub fn energy(mut self, kwh: f64) -> Self {
        self.energy_delivered_kwh = Some(kwh);
        self
    }

    #[must_use]
    pub fn power(mut self, kw: f64) -> Self {
        self.power_kw = Some(kw);
        self
    }

    #[must_use]
    pub fn battery(mut self, pct: f64) -> Self {
        self.battery_pct = Some(pct);
        self
    }

    #[must_use]
    pub fn location(mut self, lat: f64, lng: f64) -> Self {
        self.lat = Some(lat);
        self.lng = Some(lng);
        self
    }

    #[must_use]
    pub fn connector(mut self, connector_type: impl Into<String>) -> Self {
        self.connector_type = Some(connector_type.into());
        self
    }

    #[must_use]
    pub fn verification(
        mut self,
        source: impl Into<String>,
        method: impl Into<String>,
        verified: bool,
    ) -> Self {
        self.verification_source = source.into();
        self.verification_method = method.into();
        self.verified = verified;
        self
    }

    #[must_use]
    pub fn source_session_id(mut self, id: impl Into<String>) -> Self {
        self.source_session_id = Some(id.into());
        self
    }
}
