//! Charging sessions.
//!
//! A `SessionEvent` is mutable only while `session_end` is `None`. Once
//! finalized it carries a duration, a quality score and the reason it ended.

use chrono::{DateTime, Utc};
use sea_orm::{ActiveValue, entity::prelude::*};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EngineError, ResultEngine, util::parse_uuid};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndedReason {
    ChargingStopped,
    ManualStop,
    StaleCleanup,
}

impl EndedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChargingStopped => "charging_stopped",
            Self::ManualStop => "manual_stop",
            Self::StaleCleanup => "stale_cleanup",
        }
    }
}

impl TryFrom<&str> for EndedReason {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "charging_stopped" => Ok(Self::ChargingStopped),
            "manual_stop" => Ok(Self::ManualStop),
            "stale_cleanup" => Ok(Self::StaleCleanup),
            other => Err(EngineError::Corrupted(format!(
                "invalid ended reason: {other}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationPoint {
    pub lat: f64,
    pub lng: f64,
    pub at: DateTime<Utc>,
}

/// Inputs of the quality heuristic.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QualityInputs {
    pub duration_minutes: i64,
    pub kwh_delivered: f64,
    pub verified: bool,
    pub battery_increased: bool,
}

/// Weighted quality heuristic, clamped to `0..=100`.
///
/// Base 50; duration +20 (>= 15 min), +10 (>= 5 min) or -30 (< 2 min);
/// energy +15 (> 1 kWh) or +5 (> 0); +10 if verified; +5 if the battery
/// level went up.
pub fn quality_score(inputs: QualityInputs) -> i32 {
    let mut score = 50;
    if inputs.duration_minutes >= 15 {
        score += 20;
    } else if inputs.duration_minutes >= 5 {
        score += 10;
    } else if inputs.duration_minutes < 2 {
        score -= 30;
    }
    if inputs.kwh_delivered > 1.0 {
        score += 15;
    } else if inputs.kwh_delivered > 0.0 {
        score += 5;
    }
    if inputs.verified {
        score += 10;
    }
    if inputs.battery_increased {
        score += 5;
    }
    score.clamp(0, 100)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: Uuid,
    pub driver_id: String,
    pub vehicle_ref: Option<String>,
    pub charger_id: Option<String>,
    pub charger_network: Option<String>,
    pub zone: Option<String>,
    pub connector_type: Option<String>,
    /// Peak power observed during the session.
    pub power_kw: Option<f64>,
    pub session_start: DateTime<Utc>,
    pub session_end: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
    pub kwh_delivered: f64,
    pub verification_source: String,
    pub verification_method: String,
    pub verified: bool,
    pub source_session_id: Option<String>,
    pub quality_score: Option<i32>,
    pub ended_reason: Option<EndedReason>,
    pub start_lat: Option<f64>,
    pub start_lng: Option<f64>,
    pub battery_start_pct: Option<f64>,
    pub battery_end_pct: Option<f64>,
    pub location_trail: Vec<LocationPoint>,
    pub last_update_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl SessionEvent {
    pub fn is_active(&self) -> bool {
        self.session_end.is_none()
    }

    /// Where the session happened: start coordinates, else the last trail point.
    pub fn location(&self) -> Option<(f64, f64)> {
        match (self.start_lat, self.start_lng) {
            (Some(lat), Some(lng)) => Some((lat, lng)),
            _ => self.location_trail.last().map(|p| (p.lat, p.lng)),
        }
    }

    pub fn battery_increased(&self) -> bool {
        matches!(
            (self.battery_start_pct, self.battery_end_pct),
            (Some(start), Some(end)) if end > start
        )
    }

    /// Whole minutes elapsed since the start, as of `at`.
    pub fn elapsed_minutes(&self, at: DateTime<Utc>) -> i64 {
        (at - self.session_start).num_minutes().max(0)
    }

    /// Append a point, keeping only the most recent `limit`.
    pub(crate) fn push_location(&mut self, point: LocationPoint, limit: usize) {
        self.location_trail.push(point);
        if self.location_trail.len() > limit {
            let overflow = self.location_trail.len() - limit;
            self.location_trail.drain(..overflow);
        }
    }

    /// Close the session. Identity fields are left untouched.
    pub(crate) fn finalize(&mut self, ended_at: DateTime<Utc>, reason: EndedReason) {
        let duration_minutes = self.elapsed_minutes(ended_at);
        self.session_end = Some(ended_at);
        self.duration_minutes = Some(duration_minutes);
        self.ended_reason = Some(reason);
        self.quality_score = Some(quality_score(QualityInputs {
            duration_minutes,
            kwh_delivered: self.kwh_delivered,
            verified: self.verified,
            battery_increased: self.battery_increased(),
        }));
    }
}

/// What a client status endpoint shows after a poll.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollStatus {
    pub active: bool,
    pub session_id: Option<Uuid>,
    pub duration_minutes: Option<i64>,
    pub grant_issued: bool,
    pub grant_id: Option<Uuid>,
}

impl PollStatus {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn active(session: &SessionEvent, at: DateTime<Utc>) -> Self {
        Self {
            active: true,
            session_id: Some(session.id),
            duration_minutes: Some(session.elapsed_minutes(at)),
            grant_issued: false,
            grant_id: None,
        }
    }

    pub fn ended(session: &SessionEvent, grant_id: Option<Uuid>) -> Self {
        Self {
            active: false,
            session_id: Some(session.id),
            duration_minutes: session.duration_minutes,
            grant_issued: grant_id.is_some(),
            grant_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "session_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub driver_id: String,
    pub vehicle_ref: Option<String>,
    pub charger_id: Option<String>,
    pub charger_network: Option<String>,
    pub zone: Option<String>,
    pub connector_type: Option<String>,
    pub power_kw: Option<f64>,
    pub session_start: DateTimeUtc,
    pub session_end: Option<DateTimeUtc>,
    pub duration_minutes: Option<i64>,
    pub kwh_delivered: f64,
    pub verification_source: String,
    pub verification_method: String,
    pub verified: bool,
    pub source_session_id: Option<String>,
    pub quality_score: Option<i32>,
    pub ended_reason: Option<String>,
    pub start_lat: Option<f64>,
    pub start_lng: Option<f64>,
    pub battery_start_pct: Option<f64>,
    pub battery_end_pct: Option<f64>,
    pub location_trail: String,
    pub last_update_at: DateTimeUtc,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<&SessionEvent> for ActiveModel {
    type Error = EngineError;

    fn try_from(session: &SessionEvent) -> ResultEngine<Self> {
        let trail = serde_json::to_string(&session.location_trail)
            .map_err(|err| EngineError::InvalidSession(format!("invalid location trail: {err}")))?;
        Ok(Self {
            id: ActiveValue::Set(session.id.to_string()),
            driver_id: ActiveValue::Set(session.driver_id.clone()),
            vehicle_ref: ActiveValue::Set(session.vehicle_ref.clone()),
            charger_id: ActiveValue::Set(session.charger_id.clone()),
            charger_network: ActiveValue::Set(session.charger_network.clone()),
            zone: ActiveValue::Set(session.zone.clone()),
            connector_type: ActiveValue::Set(session.connector_type.clone()),
            power_kw: ActiveValue::Set(session.power_kw),
            session_start: ActiveValue::Set(session.session_start),
            session_end: ActiveValue::Set(session.session_end),
            duration_minutes: ActiveValue::Set(session.duration_minutes),
            kwh_delivered: ActiveValue::Set(session.kwh_delivered),
            verification_source: ActiveValue::Set(session.verification_source.clone()),
            verification_method: ActiveValue::Set(session.verification_method.clone()),
            verified: ActiveValue::Set(session.verified),
            source_session_id: ActiveValue::Set(session.source_session_id.clone()),
            quality_score: ActiveValue::Set(session.quality_score),
            ended_reason: ActiveValue::Set(session.ended_reason.map(|r| r.as_str().to_string())),
            start_lat: ActiveValue::Set(session.start_lat),
            start_lng: ActiveValue::Set(session.start_lng),
            battery_start_pct: ActiveValue::Set(session.battery_start_pct),
            battery_end_pct: ActiveValue::Set(session.battery_end_pct),
            location_trail: ActiveValue::Set(trail),
            last_update_at: ActiveValue::Set(session.last_update_at),
            created_at: ActiveValue::Set(session.created_at),
        })
    }
}

impl TryFrom<Model> for SessionEvent {
    type Error = EngineError;

    fn try_from(model: Model) -> ResultEngine<Self> {
        let location_trail = serde_json::from_str(&model.location_trail)
            .map_err(|err| EngineError::Corrupted(format!("invalid location trail: {err}")))?;
        Ok(Self {
            id: parse_uuid(&model.id, "session")?,
            driver_id: model.driver_id,
            vehicle_ref: model.vehicle_ref,
            charger_id: model.charger_id,
            charger_network: model.charger_network,
            zone: model.zone,
            connector_type: model.connector_type,
            power_kw: model.power_kw,
            session_start: model.session_start,
            session_end: model.session_end,
            duration_minutes: model.duration_minutes,
            kwh_delivered: model.kwh_delivered,
            verification_source: model.verification_source,
            verification_method: model.verification_method,
            verified: model.verified,
            source_session_id: model.source_session_id,
            quality_score: model.quality_score,
            ended_reason: model
                .ended_reason
                .as_deref()
                .map(EndedReason::try_from)
                .transpose()?,
            start_lat: model.start_lat,
            start_lng: model.start_lng,
            battery_start_pct: model.battery_start_pct,
            battery_end_pct: model.battery_end_pct,
            location_trail,
            last_update_at: model.last_update_at,
            created_at: model.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    use super::*;

    fn session(start: DateTime<Utc>) -> SessionEvent {
        SessionEvent {
            id: Uuid::new_v4(),
            driver_id: "alice".to_string(),
            vehicle_ref: None,
            charger_id: None,
            charger_network: None,
            zone: None,
            connector_type: None,
            power_kw: None,
            session_start: start,
            session_end: None,
            duration_minutes: None,
            kwh_delivered: 0.0,
            verification_source: "telemetry".to_string(),
            verification_method: "vehicle_poll".to_string(),
            verified: true,
            source_session_id: None,
            quality_score: None,
            ended_reason: None,
            start_lat: None,
            start_lng: None,
            battery_start_pct: None,
            battery_end_pct: None,
            location_trail: Vec::new(),
            last_update_at: start,
            created_at: start,
        }
    }

    #[test]
    fn long_verified_session_scores_95() {
        let score = quality_score(QualityInputs {
            duration_minutes: 20,
            kwh_delivered: 3.2,
            verified: true,
            battery_increased: false,
        });
        assert_eq!(score, 95);
    }

    #[test]
    fn score_buckets() {
        let base = QualityInputs {
            duration_minutes: 3,
            kwh_delivered: 0.0,
            verified: false,
            battery_increased: false,
        };
        assert_eq!(quality_score(base), 50);
        assert_eq!(
            quality_score(QualityInputs {
                duration_minutes: 1,
                ..base
            }),
            20
        );
        assert_eq!(
            quality_score(QualityInputs {
                duration_minutes: 5,
                kwh_delivered: 0.4,
                ..base
            }),
            65
        );
        assert_eq!(
            quality_score(QualityInputs {
                duration_minutes: 45,
                kwh_delivered: 12.0,
                verified: true,
                battery_increased: true,
            }),
            100
        );
    }

    #[test]
    fn finalize_sets_duration_and_reason() {
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        let mut s = session(start);
        s.kwh_delivered = 3.2;
        s.battery_start_pct = Some(40.0);
        s.battery_end_pct = Some(55.0);
        s.finalize(start + Duration::seconds(20 * 60 + 59), EndedReason::ChargingStopped);

        assert!(!s.is_active());
        assert_eq!(s.duration_minutes, Some(20));
        assert_eq!(s.quality_score, Some(100));
        assert_eq!(s.ended_reason, Some(EndedReason::ChargingStopped));
    }

    #[test]
    fn trail_keeps_most_recent_points() {
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        let mut s = session(start);
        for i in 0..8 {
            s.push_location(
                LocationPoint {
                    lat: 45.0 + f64::from(i),
                    lng: 9.0,
                    at: start + Duration::minutes(i64::from(i)),
                },
                5,
            );
        }
        assert_eq!(s.location_trail.len(), 5);
        assert_eq!(s.location_trail[0].lat, 48.0);
        assert_eq!(s.location().map(|(lat, _)| lat), Some(52.0));
    }

    proptest! {
        #[test]
        fn score_stays_in_range(
            duration in -10i64..10_000,
            kwh in 0.0f64..500.0,
            verified in any::<bool>(),
            battery in any::<bool>(),
        ) {
            let score = quality_score(QualityInputs {
                duration_minutes: duration,
                kwh_delivered: kwh,
                verified,
                battery_increased: battery,
            });
            prop_assert!((0..=100).contains(&score));
        }
    }
}
