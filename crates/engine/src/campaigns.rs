//! The module contains `Campaign` and its lifecycle.
//!
//! A campaign is a budget-capped incentive program. Its budget counters
//! (`spent_cents`, `sessions_granted`) are only moved by conditional updates
//! in `ops::incentives`; everything else is edited through the registry
//! while the campaign is `Draft` or `Paused`.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sea_orm::{ActiveValue, entity::prelude::*};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EngineError, ResultEngine, TargetingRules, util::parse_uuid};

/// Upper bound of a campaign budget; keeps `spent + cost` far from overflow.
pub const MAX_BUDGET_CENTS: i64 = 1_000_000_000_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Exhausted,
    Completed,
    Canceled,
}

impl CampaignStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Exhausted => "exhausted",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
        }
    }

    /// Whether targeting, budget and schedule may be edited.
    pub fn is_editable(self) -> bool {
        matches!(self, Self::Draft | Self::Paused)
    }

    /// Allowed lifecycle edges.
    ///
    /// `Exhausted -> Active` is only taken by a clawback that frees budget.
    pub fn can_transition(self, to: Self) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, to),
            (Draft, Active)
                | (Draft, Canceled)
                | (Active, Paused)
                | (Active, Exhausted)
                | (Active, Completed)
                | (Active, Canceled)
                | (Paused, Active)
                | (Paused, Exhausted)
                | (Paused, Completed)
                | (Paused, Canceled)
                | (Exhausted, Active)
                | (Exhausted, Completed)
        )
    }

    pub(crate) fn ensure_transition(self, to: Self) -> ResultEngine<()> {
        if !self.can_transition(to) {
            return Err(EngineError::InvalidTransition(format!(
                "campaign cannot go from {} to {}",
                self.as_str(),
                to.as_str()
            )));
        }
        Ok(())
    }
}

impl TryFrom<&str> for CampaignStatus {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "exhausted" => Ok(Self::Exhausted),
            "completed" => Ok(Self::Completed),
            "canceled" => Ok(Self::Canceled),
            other => Err(EngineError::Corrupted(format!(
                "invalid campaign status: {other}"
            ))),
        }
    }
}

/// Per-driver grant caps; `None` means uncapped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverCaps {
    /// Grants per driver per local calendar day.
    pub daily: Option<i32>,
    /// Grants per driver over the campaign lifetime.
    pub lifetime: Option<i32>,
    /// Grants per driver per charger over the campaign lifetime.
    pub per_charger: Option<i32>,
}

impl DriverCaps {
    pub(crate) fn validate(&self) -> ResultEngine<()> {
        for (label, cap) in [
            ("daily", self.daily),
            ("lifetime", self.lifetime),
            ("per_charger", self.per_charger),
        ] {
            if cap.is_some_and(|c| c <= 0) {
                return Err(EngineError::InvalidCampaign(format!(
                    "{label} cap must be > 0"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub sponsor_name: String,
    pub sponsor_ref: Option<String>,
    pub budget_cents: i64,
    pub spent_cents: i64,
    pub cost_per_session_cents: i64,
    pub max_sessions: Option<i64>,
    pub sessions_granted: i64,
    /// Lower wins.
    pub priority: i32,
    pub status: CampaignStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub timezone: Tz,
    pub rules: TargetingRules,
    pub caps: DriverCaps,
    pub pause_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// No further session can be paid for.
    pub fn is_consumed(&self) -> bool {
        self.spent_cents
            .checked_add(self.cost_per_session_cents)
            .is_none_or(|next| next > self.budget_cents)
            || self
                .max_sessions
                .is_some_and(|max| self.sessions_granted >= max)
    }

    pub(crate) fn validate(&self) -> ResultEngine<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidCampaign(
                "campaign name must not be empty".to_string(),
            ));
        }
        if self.sponsor_name.trim().is_empty() {
            return Err(EngineError::InvalidCampaign(
                "sponsor name must not be empty".to_string(),
            ));
        }
        if self.budget_cents <= 0 {
            return Err(EngineError::InvalidCampaign(
                "budget_cents must be > 0".to_string(),
            ));
        }
        if self.budget_cents > MAX_BUDGET_CENTS {
            return Err(EngineError::InvalidCampaign(format!(
                "budget_cents must be <= {MAX_BUDGET_CENTS}"
            )));
        }
        if self.cost_per_session_cents <= 0 {
            return Err(EngineError::InvalidCampaign(
                "cost_per_session_cents must be > 0".to_string(),
            ));
        }
        if self.cost_per_session_cents > self.budget_cents {
            return Err(EngineError::InvalidCampaign(
                "cost_per_session_cents exceeds budget_cents".to_string(),
            ));
        }
        if self.spent_cents > self.budget_cents {
            return Err(EngineError::InvalidCampaign(
                "budget_cents is below spent_cents".to_string(),
            ));
        }
        if self.max_sessions.is_some_and(|max| max <= 0) {
            return Err(EngineError::InvalidCampaign(
                "max_sessions must be > 0".to_string(),
            ));
        }
        if let Some(end) = self.end_date
            && end <= self.start_date
        {
            return Err(EngineError::InvalidCampaign(
                "end_date must be after start_date".to_string(),
            ));
        }
        self.rules.validate()?;
        self.caps.validate()
    }
}

pub(crate) fn parse_timezone(value: &str) -> ResultEngine<Tz> {
    value
        .parse::<Tz>()
        .map_err(|_| EngineError::InvalidCampaign(format!("unknown timezone: {value}")))
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "campaigns")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub sponsor_name: String,
    pub sponsor_ref: Option<String>,
    pub budget_cents: i64,
    pub spent_cents: i64,
    pub cost_per_session_cents: i64,
    pub max_sessions: Option<i64>,
    pub sessions_granted: i64,
    pub priority: i32,
    pub status: String,
    pub start_date: DateTimeUtc,
    pub end_date: Option<DateTimeUtc>,
    pub timezone: String,
    pub rules: String,
    pub daily_cap: Option<i32>,
    pub lifetime_cap: Option<i32>,
    pub per_charger_cap: Option<i32>,
    pub pause_reason: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::grants::Entity")]
    Grants,
}

impl Related<super::grants::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Grants.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<&Campaign> for ActiveModel {
    type Error = EngineError;

    fn try_from(campaign: &Campaign) -> Result<Self, Self::Error> {
        let rules = serde_json::to_string(&campaign.rules)
            .map_err(|err| EngineError::InvalidCampaign(format!("invalid rules: {err}")))?;
        Ok(Self {
            id: ActiveValue::Set(campaign.id.to_string()),
            name: ActiveValue::Set(campaign.name.clone()),
            description: ActiveValue::Set(campaign.description.clone()),
            sponsor_name: ActiveValue::Set(campaign.sponsor_name.clone()),
            sponsor_ref: ActiveValue::Set(campaign.sponsor_ref.clone()),
            budget_cents: ActiveValue::Set(campaign.budget_cents),
            spent_cents: ActiveValue::Set(campaign.spent_cents),
            cost_per_session_cents: ActiveValue::Set(campaign.cost_per_session_cents),
            max_sessions: ActiveValue::Set(campaign.max_sessions),
            sessions_granted: ActiveValue::Set(campaign.sessions_granted),
            priority: ActiveValue::Set(campaign.priority),
            status: ActiveValue::Set(campaign.status.as_str().to_string()),
            start_date: ActiveValue::Set(campaign.start_date),
            end_date: ActiveValue::Set(campaign.end_date),
            timezone: ActiveValue::Set(campaign.timezone.name().to_string()),
            rules: ActiveValue::Set(rules),
            daily_cap: ActiveValue::Set(campaign.caps.daily),
            lifetime_cap: ActiveValue::Set(campaign.caps.lifetime),
            per_charger_cap: ActiveValue::Set(campaign.caps.per_charger),
            pause_reason: ActiveValue::Set(campaign.pause_reason.clone()),
            created_at: ActiveValue::Set(campaign.created_at),
            updated_at: ActiveValue::Set(campaign.updated_at),
        })
    }
}

impl TryFrom<Model> for Campaign {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let rules = serde_json::from_str(&model.rules)
            .map_err(|err| EngineError::Corrupted(format!("invalid campaign rules: {err}")))?;
        let timezone = model
            .timezone
            .parse::<Tz>()
            .map_err(|_| EngineError::Corrupted(format!("invalid timezone: {}", model.timezone)))?;
        Ok(Self {
            id: parse_uuid(&model.id, "campaign")?,
            name: model.name,
            description: model.description,
            sponsor_name: model.sponsor_name,
            sponsor_ref: model.sponsor_ref,
            budget_cents: model.budget_cents,
            spent_cents: model.spent_cents,
            cost_per_session_cents: model.cost_per_session_cents,
            max_sessions: model.max_sessions,
            sessions_granted: model.sessions_granted,
            priority: model.priority,
            status: CampaignStatus::try_from(model.status.as_str())?,
            start_date: model.start_date,
            end_date: model.end_date,
            timezone,
            rules,
            caps: DriverCaps {
                daily: model.daily_cap,
                lifetime: model.lifetime_cap,
                per_charger: model.per_charger_cap,
            },
            pause_reason: model.pause_reason,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn campaign() -> Campaign {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        Campaign {
            id: Uuid::new_v4(),
            name: "Night owls".to_string(),
            description: None,
            sponsor_name: "ACME Energy".to_string(),
            sponsor_ref: None,
            budget_cents: 10_000,
            spent_cents: 0,
            cost_per_session_cents: 500,
            max_sessions: None,
            sessions_granted: 0,
            priority: 10,
            status: CampaignStatus::Active,
            start_date: now,
            end_date: Some(now + Duration::days(30)),
            timezone: Tz::UTC,
            rules: TargetingRules::default(),
            caps: DriverCaps::default(),
            pause_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn lifecycle_edges() {
        use CampaignStatus::*;
        assert!(Draft.can_transition(Active));
        assert!(Active.can_transition(Paused));
        assert!(Paused.can_transition(Active));
        assert!(Exhausted.can_transition(Active));
        assert!(!Draft.can_transition(Paused));
        assert!(!Exhausted.can_transition(Paused));
        assert!(!Completed.can_transition(Active));
        assert!(!Canceled.can_transition(Draft));
        assert_eq!(
            Completed.ensure_transition(Active).unwrap_err(),
            EngineError::InvalidTransition(
                "campaign cannot go from completed to active".to_string()
            )
        );
    }

    #[test]
    fn oversized_budget_is_rejected() {
        let mut c = campaign();
        c.budget_cents = MAX_BUDGET_CENTS;
        assert!(c.validate().is_ok());
        c.budget_cents = MAX_BUDGET_CENTS + 1;
        assert!(matches!(c.validate(), Err(EngineError::InvalidCampaign(_))));

        c.spent_cents = i64::MAX;
        c.budget_cents = i64::MAX;
        assert!(c.is_consumed());
    }

    #[test]
    fn consumed_when_next_session_does_not_fit() {
        let mut c = campaign();
        c.spent_cents = 9_500;
        assert!(!c.is_consumed());
        c.spent_cents = 9_600;
        assert!(c.is_consumed());

        let mut c = campaign();
        c.max_sessions = Some(2);
        c.sessions_granted = 2;
        assert!(c.is_consumed());
    }

    #[test]
    fn validate_budget_fields() {
        let mut c = campaign();
        c.cost_per_session_cents = 20_000;
        assert_eq!(
            c.validate().unwrap_err(),
            EngineError::InvalidCampaign("cost_per_session_cents exceeds budget_cents".to_string())
        );

        let mut c = campaign();
        c.end_date = Some(c.start_date);
        assert!(c.validate().is_err());

        let mut c = campaign();
        c.caps.daily = Some(0);
        assert!(c.validate().is_err());
    }
}
