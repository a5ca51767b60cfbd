//! Interfaces of the systems the engine talks to but does not own.
//!
//! Implementations live outside this crate (vehicle APIs, the charger
//! catalogue, push/email delivery); the engine receives them through
//! `EngineBuilder`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{IncentiveGrant, TelemetrySnapshot};

/// One reading from the vehicle telemetry provider.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub charging: bool,
    pub energy_delivered_kwh: Option<f64>,
    pub power_kw: Option<f64>,
    pub battery_pct: Option<f64>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

impl TelemetryReading {
    pub fn into_snapshot(self, vehicle_ref: &str, observed_at: DateTime<Utc>) -> TelemetrySnapshot {
        let mut snapshot = TelemetrySnapshot::new(self.charging, observed_at);
        snapshot.vehicle_ref = Some(vehicle_ref.to_string());
        snapshot.energy_delivered_kwh = self.energy_delivered_kwh;
        snapshot.power_kw = self.power_kw;
        snapshot.battery_pct = self.battery_pct;
        snapshot.lat = self.lat;
        snapshot.lng = self.lng;
        snapshot
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("vehicle is asleep")]
    DeviceAsleep,
    #[error("transient telemetry failure: {0}")]
    Transient(String),
    #[error("telemetry failure: {0}")]
    Fatal(String),
}

impl TelemetryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DeviceAsleep | Self::Transient(_))
    }
}

#[async_trait]
pub trait TelemetryProvider: Send + Sync {
    async fn poll(&self, vehicle_ref: &str) -> Result<TelemetryReading, TelemetryError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Charger {
    pub id: String,
    pub network: Option<String>,
    pub zone: Option<String>,
    pub lat: f64,
    pub lng: f64,
}

#[async_trait]
pub trait ChargerDirectory: Send + Sync {
    async fn nearest_charger(&self, lat: f64, lng: f64, radius_m: f64) -> Option<Charger>;
}

/// Informed after a grant commits. Errors are logged, never propagated.
#[async_trait]
pub trait GrantNotifier: Send + Sync {
    async fn grant_issued(&self, grant: &IncentiveGrant) -> Result<(), String>;
}
