use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sea_orm::{
    ConnectionTrait, QueryFilter, QueryOrder, TransactionTrait, prelude::*,
    sea_query::Expr,
};
use uuid::Uuid;

use crate::{
    Campaign, CampaignPatch, CampaignStatus, EngineError, NewCampaignCmd, ResultEngine,
    campaigns::{self, parse_timezone},
    util::{normalize_optional_text, normalize_required_text},
};

use super::{Engine, with_tx};

pub(super) async fn load_campaign<C: ConnectionTrait>(
    conn: &C,
    campaign_id: Uuid,
) -> ResultEngine<Campaign> {
    let model = campaigns::Entity::find_by_id(campaign_id.to_string())
        .one(conn)
        .await?
        .ok_or_else(|| EngineError::KeyNotFound(format!("campaign {campaign_id} not exists")))?;
    Campaign::try_from(model)
}

/// Campaigns that can pay for a session ending at `now`, best priority first.
pub(super) async fn list_active_at<C: ConnectionTrait>(
    conn: &C,
    now: DateTime<Utc>,
) -> ResultEngine<Vec<Campaign>> {
    campaigns::Entity::find()
        .filter(campaigns::Column::Status.eq(CampaignStatus::Active.as_str()))
        .filter(campaigns::Column::StartDate.lte(now))
        .filter(
            campaigns::Column::EndDate
                .is_null()
                .or(campaigns::Column::EndDate.gte(now)),
        )
        .filter(Expr::col(campaigns::Column::SpentCents).lt(Expr::col(campaigns::Column::BudgetCents)))
        .order_by_asc(campaigns::Column::Priority)
        .order_by_asc(campaigns::Column::CreatedAt)
        .order_by_asc(campaigns::Column::Id)
        .all(conn)
        .await?
        .into_iter()
        .map(Campaign::try_from)
        .collect()
}

/// Move a campaign from `from` to `to` iff it is still in `from`.
pub(super) async fn set_status<C: ConnectionTrait>(
    conn: &C,
    campaign_id: Uuid,
    from: CampaignStatus,
    to: CampaignStatus,
    pause_reason: Option<String>,
    now: DateTime<Utc>,
) -> ResultEngine<bool> {
    from.ensure_transition(to)?;
    let result = campaigns::Entity::update_many()
        .col_expr(campaigns::Column::Status, Expr::value(to.as_str()))
        .col_expr(campaigns::Column::PauseReason, Expr::value(pause_reason))
        .col_expr(campaigns::Column::UpdatedAt, Expr::value(now))
        .filter(campaigns::Column::Id.eq(campaign_id.to_string()))
        .filter(campaigns::Column::Status.eq(from.as_str()))
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

fn apply_patch(campaign: &mut Campaign, patch: CampaignPatch) -> ResultEngine<()> {
    if let Some(name) = patch.name {
        campaign.name = normalize_required_text(&name, "name")?;
    }
    if let Some(description) = patch.description {
        campaign.description = normalize_optional_text(description.as_deref());
    }
    if let Some(sponsor_name) = patch.sponsor_name {
        campaign.sponsor_name = normalize_required_text(&sponsor_name, "sponsor_name")?;
    }
    if let Some(sponsor_ref) = patch.sponsor_ref {
        campaign.sponsor_ref = normalize_optional_text(sponsor_ref.as_deref());
    }
    if let Some(budget_cents) = patch.budget_cents {
        campaign.budget_cents = budget_cents;
    }
    if let Some(cost) = patch.cost_per_session_cents {
        campaign.cost_per_session_cents = cost;
    }
    if let Some(max_sessions) = patch.max_sessions {
        campaign.max_sessions = max_sessions;
    }
    if let Some(priority) = patch.priority {
        campaign.priority = priority;
    }
    if let Some(start_date) = patch.start_date {
        campaign.start_date = start_date;
    }
    if let Some(end_date) = patch.end_date {
        campaign.end_date = end_date;
    }
    if let Some(timezone) = patch.timezone {
        campaign.timezone = parse_timezone(timezone.trim())?;
    }
    if let Some(rules) = patch.rules {
        campaign.rules = rules;
    }
    if let Some(caps) = patch.caps {
        campaign.caps = caps;
    }
    Ok(())
}

impl Engine {
    /// Create a campaign in `Draft`.
    pub async fn create_campaign(&self, cmd: NewCampaignCmd) -> ResultEngine<Campaign> {
        let now = Utc::now();
        let timezone = match cmd.timezone.as_deref() {
            Some(name) => parse_timezone(name.trim())?,
            None => Tz::UTC,
        };
        let campaign = Campaign {
            id: Uuid::new_v4(),
            name: normalize_required_text(&cmd.name, "name")
                .map_err(|err| EngineError::InvalidCampaign(err.to_string()))?,
            description: normalize_optional_text(cmd.description.as_deref()),
            sponsor_name: normalize_required_text(&cmd.sponsor_name, "sponsor_name")
                .map_err(|err| EngineError::InvalidCampaign(err.to_string()))?,
            sponsor_ref: normalize_optional_text(cmd.sponsor_ref.as_deref()),
            budget_cents: cmd.budget_cents,
            spent_cents: 0,
            cost_per_session_cents: cmd.cost_per_session_cents,
            max_sessions: cmd.max_sessions,
            sessions_granted: 0,
            priority: cmd.priority,
            status: CampaignStatus::Draft,
            start_date: cmd.start_date,
            end_date: cmd.end_date,
            timezone,
            rules: cmd.rules,
            caps: cmd.caps,
            pause_reason: None,
            created_at: now,
            updated_at: now,
        };
        campaign.validate()?;

        campaigns::ActiveModel::try_from(&campaign)?
            .insert(&self.database)
            .await?;
        tracing::info!("created campaign {} ({})", campaign.id, campaign.name);
        Ok(campaign)
    }

    /// Edit a `Draft` or `Paused` campaign.
    ///
    /// Budget counters are never written here, so a clawback landing on a
    /// paused campaign is not lost.
    pub async fn update_campaign(
        &self,
        campaign_id: Uuid,
        patch: CampaignPatch,
    ) -> ResultEngine<Campaign> {
        let now = Utc::now();
        with_tx!(self, |db_tx| {
            let mut campaign = load_campaign(&db_tx, campaign_id).await?;
            if !campaign.status.is_editable() {
                return Err(EngineError::InvalidTransition(format!(
                    "campaign is {}, edits need draft or paused",
                    campaign.status.as_str()
                )));
            }
            if patch.is_empty() {
                return Ok(campaign);
            }

            apply_patch(&mut campaign, patch)
                .map_err(|err| match err {
                    EngineError::InvalidAmount(msg) => EngineError::InvalidCampaign(msg),
                    other => other,
                })?;
            campaign.updated_at = now;
            campaign.validate()?;

            let full = campaigns::ActiveModel::try_from(&campaign)?;
            let model = campaigns::ActiveModel {
                name: full.name,
                description: full.description,
                sponsor_name: full.sponsor_name,
                sponsor_ref: full.sponsor_ref,
                budget_cents: full.budget_cents,
                cost_per_session_cents: full.cost_per_session_cents,
                max_sessions: full.max_sessions,
                priority: full.priority,
                start_date: full.start_date,
                end_date: full.end_date,
                timezone: full.timezone,
                rules: full.rules,
                daily_cap: full.daily_cap,
                lifetime_cap: full.lifetime_cap,
                per_charger_cap: full.per_charger_cap,
                updated_at: full.updated_at,
                ..Default::default()
            };
            let result = campaigns::Entity::update_many()
                .set(model)
                .filter(campaigns::Column::Id.eq(campaign_id.to_string()))
                .filter(campaigns::Column::Status.eq(campaign.status.as_str()))
                .exec(&db_tx)
                .await?;
            if result.rows_affected == 0 {
                return Err(EngineError::InvalidTransition(
                    "campaign changed concurrently".to_string(),
                ));
            }

            load_campaign(&db_tx, campaign_id).await
        })
    }

    /// `Draft -> Active`.
    pub async fn activate_campaign(&self, campaign_id: Uuid) -> ResultEngine<Campaign> {
        let now = Utc::now();
        with_tx!(self, |db_tx| {
            let campaign = load_campaign(&db_tx, campaign_id).await?;
            if campaign.status != CampaignStatus::Draft {
                return Err(EngineError::InvalidTransition(format!(
                    "only draft campaigns can be activated, campaign is {}",
                    campaign.status.as_str()
                )));
            }
            campaign.validate()?;
            self.transition(&db_tx, &campaign, CampaignStatus::Active, None, now)
                .await
        })
    }

    /// `Active -> Paused`, keeping the reason.
    pub async fn pause_campaign(&self, campaign_id: Uuid, reason: &str) -> ResultEngine<Campaign> {
        let now = Utc::now();
        let reason = normalize_optional_text(Some(reason));
        with_tx!(self, |db_tx| {
            let campaign = load_campaign(&db_tx, campaign_id).await?;
            if campaign.status != CampaignStatus::Active {
                return Err(EngineError::InvalidTransition(format!(
                    "only active campaigns can be paused, campaign is {}",
                    campaign.status.as_str()
                )));
            }
            self.transition(&db_tx, &campaign, CampaignStatus::Paused, reason, now)
                .await
        })
    }

    /// `Paused -> Active`.
    ///
    /// Refused once the budget is spent. A campaign that can no longer pay
    /// for a whole session goes to `Exhausted` instead.
    pub async fn resume_campaign(&self, campaign_id: Uuid) -> ResultEngine<Campaign> {
        let now = Utc::now();
        with_tx!(self, |db_tx| {
            let campaign = load_campaign(&db_tx, campaign_id).await?;
            if campaign.status != CampaignStatus::Paused {
                return Err(EngineError::InvalidTransition(format!(
                    "only paused campaigns can be resumed, campaign is {}",
                    campaign.status.as_str()
                )));
            }
            if campaign.spent_cents >= campaign.budget_cents {
                return Err(EngineError::InvalidTransition(
                    "campaign budget is spent".to_string(),
                ));
            }
            let to = if campaign.is_consumed() {
                CampaignStatus::Exhausted
            } else {
                CampaignStatus::Active
            };
            self.transition(&db_tx, &campaign, to, None, now).await
        })
    }

    /// `Active | Paused | Exhausted -> Completed`.
    pub async fn complete_campaign(&self, campaign_id: Uuid) -> ResultEngine<Campaign> {
        let now = Utc::now();
        with_tx!(self, |db_tx| {
            let campaign = load_campaign(&db_tx, campaign_id).await?;
            self.transition(&db_tx, &campaign, CampaignStatus::Completed, None, now)
                .await
        })
    }

    /// `Draft | Active | Paused -> Canceled`.
    pub async fn cancel_campaign(&self, campaign_id: Uuid) -> ResultEngine<Campaign> {
        let now = Utc::now();
        with_tx!(self, |db_tx| {
            let campaign = load_campaign(&db_tx, campaign_id).await?;
            self.transition(&db_tx, &campaign, CampaignStatus::Canceled, None, now)
                .await
        })
    }

    /// Complete every running campaign whose end date is before `now`.
    pub async fn expire_campaigns(&self, now: DateTime<Utc>) -> ResultEngine<Vec<Uuid>> {
        with_tx!(self, |db_tx| {
            let running = [
                CampaignStatus::Active,
                CampaignStatus::Paused,
                CampaignStatus::Exhausted,
            ];
            let models = campaigns::Entity::find()
                .filter(campaigns::Column::Status.is_in(running.map(CampaignStatus::as_str)))
                .filter(campaigns::Column::EndDate.lt(now))
                .all(&db_tx)
                .await?;

            let mut completed = Vec::with_capacity(models.len());
            for model in models {
                let campaign = Campaign::try_from(model)?;
                if set_status(
                    &db_tx,
                    campaign.id,
                    campaign.status,
                    CampaignStatus::Completed,
                    None,
                    now,
                )
                .await?
                {
                    tracing::info!("campaign {} ended, marked completed", campaign.id);
                    completed.push(campaign.id);
                }
            }
            Ok(completed)
        })
    }

    /// Return a campaign by id.
    pub async fn campaign(&self, campaign_id: Uuid) -> ResultEngine<Campaign> {
        load_campaign(&self.database, campaign_id).await
    }

    /// All campaigns, optionally with one status, best priority first.
    pub async fn list_campaigns(
        &self,
        status: Option<CampaignStatus>,
    ) -> ResultEngine<Vec<Campaign>> {
        let mut query = campaigns::Entity::find();
        if let Some(status) = status {
            query = query.filter(campaigns::Column::Status.eq(status.as_str()));
        }
        query
            .order_by_asc(campaigns::Column::Priority)
            .order_by_asc(campaigns::Column::CreatedAt)
            .all(&self.database)
            .await?
            .into_iter()
            .map(Campaign::try_from)
            .collect()
    }

    /// Campaigns able to pay for a session at `now`, best priority first.
    pub async fn list_active(&self, now: DateTime<Utc>) -> ResultEngine<Vec<Campaign>> {
        list_active_at(&self.database, now).await
    }

    async fn transition<C: ConnectionTrait>(
        &self,
        conn: &C,
        campaign: &Campaign,
        to: CampaignStatus,
        pause_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> ResultEngine<Campaign> {
        if !set_status(conn, campaign.id, campaign.status, to, pause_reason, now).await? {
            return Err(EngineError::InvalidTransition(
                "campaign changed concurrently".to_string(),
            ));
        }
        tracing::info!(
            "campaign {} {} -> {}",
            campaign.id,
            campaign.status.as_str(),
            to.as_str()
        );
        load_campaign(conn, campaign.id).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{DriverCaps, TargetingRules};

    fn draft() -> Campaign {
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
            status: CampaignStatus::Draft,
            start_date: now,
            end_date: None,
            timezone: Tz::UTC,
            rules: TargetingRules::default(),
            caps: DriverCaps::default(),
            pause_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn patch_touches_only_given_fields() {
        let mut campaign = draft();
        apply_patch(
            &mut campaign,
            CampaignPatch {
                budget_cents: Some(20_000),
                description: Some(Some("  late charging ".to_string())),
                timezone: Some("Europe/Rome".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(campaign.budget_cents, 20_000);
        assert_eq!(campaign.description.as_deref(), Some("late charging"));
        assert_eq!(campaign.timezone, chrono_tz::Europe::Rome);
        assert_eq!(campaign.name, "Night owls");
        assert_eq!(campaign.cost_per_session_cents, 500);
    }

    #[test]
    fn patch_rejects_unknown_timezone() {
        let mut campaign = draft();
        let err = apply_patch(
            &mut campaign,
            CampaignPatch {
                timezone: Some("Mars/Olympus".to_string()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidCampaign("unknown timezone: Mars/Olympus".to_string())
        );
    }
}
