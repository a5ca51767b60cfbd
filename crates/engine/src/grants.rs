//! Incentive grants: one campaign rewarding one session.

use chrono::{DateTime, Utc};
use sea_orm::{ActiveValue, entity::prelude::*};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EngineError, ResultEngine, util::parse_uuid};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    /// Session claimed, budget and ledger not settled yet.
    Pending,
    Granted,
    ClawedBack,
}

impl GrantStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Granted => "granted",
            Self::ClawedBack => "clawed_back",
        }
    }
}

impl TryFrom<&str> for GrantStatus {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(Self::Pending),
            "granted" => Ok(Self::Granted),
            "clawed_back" => Ok(Self::ClawedBack),
            other => Err(EngineError::Corrupted(format!(
                "invalid grant status: {other}"
            ))),
        }
    }
}

/// Idempotency key of the ledger credit for a session.
pub fn grant_idempotency_key(session_event_id: Uuid) -> String {
    format!("campaign_grant:{session_event_id}")
}

/// Idempotency key of the ledger debit reversing a grant.
pub fn clawback_idempotency_key(grant_id: Uuid) -> String {
    format!("campaign_clawback:{grant_id}")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncentiveGrant {
    pub id: Uuid,
    pub session_event_id: Uuid,
    pub campaign_id: Uuid,
    pub driver_id: String,
    /// Charger of the rewarded session, kept for per-charger caps.
    pub charger_id: Option<String>,
    /// End of the rewarded session, kept for daily caps.
    pub session_ended_at: DateTime<Utc>,
    pub amount_cents: i64,
    pub status: GrantStatus,
    pub idempotency_key: String,
    pub transaction_id: Option<Uuid>,
    pub clawback_transaction_id: Option<Uuid>,
    pub clawback_reason: Option<String>,
    pub clawed_back_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "incentive_grants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub session_event_id: String,
    pub campaign_id: String,
    pub driver_id: String,
    pub charger_id: Option<String>,
    pub session_ended_at: DateTimeUtc,
    pub amount_cents: i64,
    pub status: String,
    pub idempotency_key: String,
    pub transaction_id: Option<String>,
    pub clawback_transaction_id: Option<String>,
    pub clawback_reason: Option<String>,
    pub clawed_back_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::campaigns::Entity",
        from = "Column::CampaignId",
        to = "super::campaigns::Column::Id",
        on_update = "NoAction",
        on_delete = "NoAction"
    )]
    Campaigns,
}

impl Related<super::campaigns::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Campaigns.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl From<&IncentiveGrant> for ActiveModel {
    fn from(grant: &IncentiveGrant) -> Self {
        Self {
            id: ActiveValue::Set(grant.id.to_string()),
            session_event_id: ActiveValue::Set(grant.session_event_id.to_string()),
            campaign_id: ActiveValue::Set(grant.campaign_id.to_string()),
            driver_id: ActiveValue::Set(grant.driver_id.clone()),
            charger_id: ActiveValue::Set(grant.charger_id.clone()),
            session_ended_at: ActiveValue::Set(grant.session_ended_at),
            amount_cents: ActiveValue::Set(grant.amount_cents),
            status: ActiveValue::Set(grant.status.as_str().to_string()),
            idempotency_key: ActiveValue::Set(grant.idempotency_key.clone()),
            transaction_id: ActiveValue::Set(grant.transaction_id.map(|id| id.to_string())),
            clawback_transaction_id: ActiveValue::Set(
                grant.clawback_transaction_id.map(|id| id.to_string()),
            ),
            clawback_reason: ActiveValue::Set(grant.clawback_reason.clone()),
            clawed_back_at: ActiveValue::Set(grant.clawed_back_at),
            created_at: ActiveValue::Set(grant.created_at),
        }
    }
}

impl TryFrom<Model> for IncentiveGrant {
    type Error = EngineError;

    fn try_from(model: Model) -> ResultEngine<Self> {
        Ok(Self {
            id: parse_uuid(&model.id, "grant")?,
            session_event_id: parse_uuid(&model.session_event_id, "session")?,
            campaign_id: parse_uuid(&model.campaign_id, "campaign")?,
            driver_id: model.driver_id,
            charger_id: model.charger_id,
            session_ended_at: model.session_ended_at,
            amount_cents: model.amount_cents,
            status: GrantStatus::try_from(model.status.as_str())?,
            idempotency_key: model.idempotency_key,
            transaction_id: model
                .transaction_id
                .as_deref()
                .map(|id| parse_uuid(id, "transaction"))
                .transpose()?,
            clawback_transaction_id: model
                .clawback_transaction_id
                .as_deref()
                .map(|id| parse_uuid(id, "transaction"))
                .transpose()?,
            clawback_reason: model.clawback_reason,
            clawed_back_at: model.clawed_back_at,
            created_at: model.created_at,
        })
    }
}
