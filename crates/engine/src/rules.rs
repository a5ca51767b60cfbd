//! Campaign targeting rules and the session facts they are matched against.
//!
//! Every rule is optional; an absent rule (or an empty set) does not
//! restrict the campaign. A present rule whose session-side value is unknown
//! never matches: a campaign targeting a zone does not reward a session
//! without a zone.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{EngineError, ResultEngine};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters (haversine).
pub fn distance_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoCircle {
    pub lat: f64,
    pub lng: f64,
    pub radius_m: f64,
}

impl GeoCircle {
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        distance_m(self.lat, self.lng, lat, lng) <= self.radius_m
    }
}

/// Local time-of-day window, `[start, end)`.
///
/// `start > end` wraps around midnight (22:00–06:00). `start == end` covers
/// the whole day.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetingRules {
    pub charger_ids: BTreeSet<String>,
    pub networks: BTreeSet<String>,
    pub zones: BTreeSet<String>,
    pub geo: Option<GeoCircle>,
    pub time_window: Option<TimeWindow>,
    pub days_of_week: Vec<Weekday>,
    pub min_duration_minutes: Option<i64>,
    pub max_duration_minutes: Option<i64>,
    pub min_power_kw: Option<f64>,
    pub connector_types: BTreeSet<String>,
    /// Inclusive bounds on the driver's finalized sessions before this one.
    pub min_prior_sessions: Option<i64>,
    pub max_prior_sessions: Option<i64>,
    pub driver_allow_list: BTreeSet<String>,
}

/// What a campaign needs to know about a finalized session.
#[derive(Clone, Debug)]
pub struct SessionFacts<'a> {
    pub driver_id: &'a str,
    pub charger_id: Option<&'a str>,
    pub network: Option<&'a str>,
    pub zone: Option<&'a str>,
    pub location: Option<(f64, f64)>,
    pub session_start: DateTime<Utc>,
    pub duration_minutes: i64,
    pub power_kw: Option<f64>,
    pub connector_type: Option<&'a str>,
    pub prior_sessions: i64,
}

/// First rule a session fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleMismatch {
    MinDuration,
    MaxDuration,
    Charger,
    Network,
    Zone,
    Geo,
    TimeOfDay,
    DayOfWeek,
    MinPower,
    Connector,
    PriorSessions,
    AllowList,
}

fn in_set(set: &BTreeSet<String>, value: Option<&str>) -> bool {
    set.is_empty() || value.is_some_and(|v| set.contains(v))
}

impl TargetingRules {
    pub fn validate(&self) -> ResultEngine<()> {
        if let Some(geo) = &self.geo {
            if !(-90.0..=90.0).contains(&geo.lat) || !(-180.0..=180.0).contains(&geo.lng) {
                return Err(EngineError::InvalidCampaign(
                    "geo center out of range".to_string(),
                ));
            }
            if !(geo.radius_m > 0.0) {
                return Err(EngineError::InvalidCampaign(
                    "geo radius must be > 0".to_string(),
                ));
            }
        }
        if let (Some(min), Some(max)) = (self.min_duration_minutes, self.max_duration_minutes)
            && min > max
        {
            return Err(EngineError::InvalidCampaign(
                "min_duration_minutes exceeds max_duration_minutes".to_string(),
            ));
        }
        if self.min_duration_minutes.is_some_and(|m| m < 0)
            || self.max_duration_minutes.is_some_and(|m| m < 0)
        {
            return Err(EngineError::InvalidCampaign(
                "duration bounds must be >= 0".to_string(),
            ));
        }
        if self.min_power_kw.is_some_and(|p| !(p >= 0.0)) {
            return Err(EngineError::InvalidCampaign(
                "min_power_kw must be >= 0".to_string(),
            ));
        }
        if let (Some(min), Some(max)) = (self.min_prior_sessions, self.max_prior_sessions)
            && min > max
        {
            return Err(EngineError::InvalidCampaign(
                "min_prior_sessions exceeds max_prior_sessions".to_string(),
            ));
        }
        Ok(())
    }

    pub fn meets_min_duration(&self, duration_minutes: i64) -> bool {
        self.min_duration_minutes
            .is_none_or(|min| duration_minutes >= min)
    }

    /// Check the session against every rule; `tz` localizes time rules.
    pub fn mismatch(&self, facts: &SessionFacts<'_>, tz: Tz) -> Option<RuleMismatch> {
        if !self.meets_min_duration(facts.duration_minutes) {
            return Some(RuleMismatch::MinDuration);
        }
        if self
            .max_duration_minutes
            .is_some_and(|max| facts.duration_minutes > max)
        {
            return Some(RuleMismatch::MaxDuration);
        }
        if !in_set(&self.charger_ids, facts.charger_id) {
            return Some(RuleMismatch::Charger);
        }
        if !in_set(&self.networks, facts.network) {
            return Some(RuleMismatch::Network);
        }
        if !in_set(&self.zones, facts.zone) {
            return Some(RuleMismatch::Zone);
        }
        if let Some(geo) = &self.geo {
            match facts.location {
                Some((lat, lng)) if geo.contains(lat, lng) => {}
                _ => return Some(RuleMismatch::Geo),
            }
        }

        let local_start = facts.session_start.with_timezone(&tz);
        if let Some(window) = &self.time_window
            && !window.contains(local_start.time())
        {
            return Some(RuleMismatch::TimeOfDay);
        }
        if !self.days_of_week.is_empty() && !self.days_of_week.contains(&local_start.weekday()) {
            return Some(RuleMismatch::DayOfWeek);
        }

        if let Some(min_power) = self.min_power_kw
            && !facts.power_kw.is_some_and(|p| p >= min_power)
        {
            return Some(RuleMismatch::MinPower);
        }
        if !in_set(&self.connector_types, facts.connector_type) {
            return Some(RuleMismatch::Connector);
        }
        if self
            .min_prior_sessions
            .is_some_and(|min| facts.prior_sessions < min)
            || self
                .max_prior_sessions
                .is_some_and(|max| facts.prior_sessions > max)
        {
            return Some(RuleMismatch::PriorSessions);
        }
        if !self.driver_allow_list.is_empty() && !self.driver_allow_list.contains(facts.driver_id) {
            return Some(RuleMismatch::AllowList);
        }
        None
    }

    pub fn matches(&self, facts: &SessionFacts<'_>, tz: Tz) -> bool {
        self.mismatch(facts, tz).is_none()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    use super::*;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn facts() -> SessionFacts<'static> {
        SessionFacts {
            driver_id: "alice",
            charger_id: Some("ch-1"),
            network: Some("ionity"),
            zone: Some("milano-centro"),
            location: Some((45.4642, 9.1900)),
            // Wednesday 2026-03-18 23:30 UTC.
            session_start: Utc.with_ymd_and_hms(2026, 3, 18, 23, 30, 0).unwrap(),
            duration_minutes: 20,
            power_kw: Some(50.0),
            connector_type: Some("ccs2"),
            prior_sessions: 0,
        }
    }

    #[test]
    fn empty_rules_match_everything() {
        assert!(TargetingRules::default().matches(&facts(), Tz::UTC));
    }

    #[test]
    fn time_window_wraps_around_midnight() {
        let window = TimeWindow {
            start: time(22, 0),
            end: time(6, 0),
        };
        assert!(window.contains(time(23, 30)));
        assert!(window.contains(time(0, 0)));
        assert!(window.contains(time(5, 59)));
        assert!(!window.contains(time(6, 0)));
        assert!(!window.contains(time(12, 0)));
        assert!(window.contains(time(22, 0)));
    }

    #[test]
    fn time_rules_use_campaign_timezone() {
        let rules = TargetingRules {
            days_of_week: vec![Weekday::Thu],
            time_window: Some(TimeWindow {
                start: time(0, 0),
                end: time(1, 0),
            }),
            ..Default::default()
        };
        // 23:30 UTC on Wednesday is 00:30 Thursday in Rome (CET).
        assert!(!rules.matches(&facts(), Tz::UTC));
        assert!(rules.matches(&facts(), chrono_tz::Europe::Rome));
    }

    #[test]
    fn geo_circle_containment() {
        let rules = TargetingRules {
            geo: Some(GeoCircle {
                lat: 45.4642,
                lng: 9.1900,
                radius_m: 500.0,
            }),
            ..Default::default()
        };
        assert!(rules.matches(&facts(), Tz::UTC));

        let mut far = facts();
        far.location = Some((45.4781, 9.2270)); // ~3 km away
        assert_eq!(rules.mismatch(&far, Tz::UTC), Some(RuleMismatch::Geo));

        let mut unknown = facts();
        unknown.location = None;
        assert_eq!(rules.mismatch(&unknown, Tz::UTC), Some(RuleMismatch::Geo));
    }

    #[test]
    fn set_rules_require_known_values() {
        let rules = TargetingRules {
            zones: BTreeSet::from(["milano-centro".to_string()]),
            connector_types: BTreeSet::from(["ccs2".to_string(), "type2".to_string()]),
            ..Default::default()
        };
        assert!(rules.matches(&facts(), Tz::UTC));

        let mut no_zone = facts();
        no_zone.zone = None;
        assert_eq!(rules.mismatch(&no_zone, Tz::UTC), Some(RuleMismatch::Zone));

        let mut chademo = facts();
        chademo.connector_type = Some("chademo");
        assert_eq!(
            rules.mismatch(&chademo, Tz::UTC),
            Some(RuleMismatch::Connector)
        );
    }

    #[test]
    fn duration_power_and_driver_targeting() {
        let rules = TargetingRules {
            min_duration_minutes: Some(15),
            max_duration_minutes: Some(60),
            min_power_kw: Some(22.0),
            max_prior_sessions: Some(0),
            driver_allow_list: BTreeSet::from(["alice".to_string()]),
            ..Default::default()
        };
        assert!(rules.matches(&facts(), Tz::UTC));

        let mut short = facts();
        short.duration_minutes = 14;
        assert_eq!(
            rules.mismatch(&short, Tz::UTC),
            Some(RuleMismatch::MinDuration)
        );

        let mut slow = facts();
        slow.power_kw = Some(11.0);
        assert_eq!(rules.mismatch(&slow, Tz::UTC), Some(RuleMismatch::MinPower));

        let mut repeat = facts();
        repeat.prior_sessions = 3;
        assert_eq!(
            rules.mismatch(&repeat, Tz::UTC),
            Some(RuleMismatch::PriorSessions)
        );

        let mut bob = facts();
        bob.driver_id = "bob";
        assert_eq!(rules.mismatch(&bob, Tz::UTC), Some(RuleMismatch::AllowList));
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let rules = TargetingRules {
            min_duration_minutes: Some(30),
            max_duration_minutes: Some(10),
            ..Default::default()
        };
        assert!(rules.validate().is_err());

        let rules = TargetingRules {
            geo: Some(GeoCircle {
                lat: 45.0,
                lng: 9.0,
                radius_m: 0.0,
            }),
            ..Default::default()
        };
        assert!(rules.validate().is_err());
    }

    proptest! {
        #[test]
        fn distance_is_symmetric_and_non_negative(
            lat1 in -89.0f64..89.0, lng1 in -179.0f64..179.0,
            lat2 in -89.0f64..89.0, lng2 in -179.0f64..179.0,
        ) {
            let d1 = distance_m(lat1, lng1, lat2, lng2);
            let d2 = distance_m(lat2, lng2, lat1, lng1);
            prop_assert!(d1 >= 0.0);
            prop_assert!((d1 - d2).abs() < 1e-6);
        }

        #[test]
        fn wrapping_window_is_complement_of_inner_window(
            start in 1u32..23, len in 1u32..22, minute in 0u32..1440,
        ) {
            let end = (start + len) % 24;
            prop_assume!(end != start);
            let forward = TimeWindow { start: time(start, 0), end: time(end, 0) };
            let backward = TimeWindow { start: time(end, 0), end: time(start, 0) };
            let t = time(minute / 60, minute % 60);
            prop_assert_ne!(forward.contains(t), backward.contains(t));
        }
    }
}
