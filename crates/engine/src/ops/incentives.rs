use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use sea_orm::{
    ActiveValue, ConnectionTrait, PaginatorTrait, QueryFilter, QueryOrder, TransactionTrait,
    prelude::*,
    sea_query::{Expr, ExprTrait},
};
use serde_json::json;
use uuid::Uuid;

use crate::{
    AccountRef, Campaign, CampaignStatus, EngineError, GrantStatus, IncentiveGrant, RecordCmd,
    ResultEngine, SessionEvent, SessionFacts, TransactionKind, campaigns,
    clawback_idempotency_key, grant_idempotency_key, grants, sessions,
    util::{is_unique_violation, normalize_optional_text},
};

use super::{
    Engine,
    campaigns::{list_active_at, load_campaign, set_status},
    ledger::record_in_tx,
    sessions::load_session,
    with_tx,
};

enum Evaluation {
    Issued(IncentiveGrant),
    Existing(IncentiveGrant),
    NoMatch,
}

/// UTC bounds of the local calendar day containing `at`.
fn local_day_bounds(tz: Tz, at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let day = at.with_timezone(&tz).date_naive();
    let midnight = |date: chrono::NaiveDate| {
        let local = date.and_time(NaiveTime::MIN);
        tz.from_local_datetime(&local)
            .earliest()
            .map_or_else(|| local.and_utc(), |start| start.with_timezone(&Utc))
    };
    let next = day.succ_opt().unwrap_or(day);
    (midnight(day), midnight(next))
}

pub(super) async fn find_grant_for_session<C: ConnectionTrait>(
    conn: &C,
    session_id: Uuid,
) -> ResultEngine<Option<IncentiveGrant>> {
    grants::Entity::find()
        .filter(grants::Column::SessionEventId.eq(session_id.to_string()))
        .one(conn)
        .await?
        .map(IncentiveGrant::try_from)
        .transpose()
}

async fn load_grant<C: ConnectionTrait>(conn: &C, grant_id: Uuid) -> ResultEngine<IncentiveGrant> {
    let model = grants::Entity::find_by_id(grant_id.to_string())
        .one(conn)
        .await?
        .ok_or_else(|| EngineError::KeyNotFound(format!("grant {grant_id} not exists")))?;
    IncentiveGrant::try_from(model)
}

/// Finalized sessions of the driver started before `session`.
async fn prior_sessions<C: ConnectionTrait>(conn: &C, session: &SessionEvent) -> ResultEngine<i64> {
    let count = sessions::Entity::find()
        .filter(sessions::Column::DriverId.eq(session.driver_id.clone()))
        .filter(sessions::Column::SessionEnd.is_not_null())
        .filter(sessions::Column::SessionStart.lt(session.session_start))
        .filter(sessions::Column::Id.ne(session.id.to_string()))
        .count(conn)
        .await?;
    Ok(i64::try_from(count).unwrap_or(i64::MAX))
}

/// Whether the driver is still under every cap of `campaign`.
async fn within_caps<C: ConnectionTrait>(
    conn: &C,
    campaign: &Campaign,
    session: &SessionEvent,
    ended_at: DateTime<Utc>,
) -> ResultEngine<bool> {
    let caps = campaign.caps;
    if caps.daily.is_none() && caps.lifetime.is_none() && caps.per_charger.is_none() {
        return Ok(true);
    }

    let existing: Vec<IncentiveGrant> = grants::Entity::find()
        .filter(grants::Column::CampaignId.eq(campaign.id.to_string()))
        .filter(grants::Column::DriverId.eq(session.driver_id.clone()))
        .filter(grants::Column::Status.ne(GrantStatus::ClawedBack.as_str()))
        .all(conn)
        .await?
        .into_iter()
        .map(IncentiveGrant::try_from)
        .collect::<ResultEngine<_>>()?;

    let reached = |cap: Option<i32>, used: usize| {
        cap.is_some_and(|cap| i64::try_from(used).unwrap_or(i64::MAX) >= i64::from(cap))
    };

    if reached(caps.lifetime, existing.len()) {
        return Ok(false);
    }
    if caps.daily.is_some() {
        let (start, end) = local_day_bounds(campaign.timezone, ended_at);
        let today = existing
            .iter()
            .filter(|g| g.session_ended_at >= start && g.session_ended_at < end)
            .count();
        if reached(caps.daily, today) {
            return Ok(false);
        }
    }
    if let Some(charger_id) = session.charger_id.as_deref() {
        let here = existing
            .iter()
            .filter(|g| g.charger_id.as_deref() == Some(charger_id))
            .count();
        if reached(caps.per_charger, here) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Take one session's worth of budget iff the campaign is active and can
/// still pay for it.
async fn reserve_budget<C: ConnectionTrait>(
    conn: &C,
    campaign: &Campaign,
    now: DateTime<Utc>,
) -> ResultEngine<bool> {
    let cost = campaign.cost_per_session_cents;
    let mut update = campaigns::Entity::update_many()
        .col_expr(
            campaigns::Column::SpentCents,
            Expr::col(campaigns::Column::SpentCents).add(cost),
        )
        .col_expr(
            campaigns::Column::SessionsGranted,
            Expr::col(campaigns::Column::SessionsGranted).add(1),
        )
        .col_expr(campaigns::Column::UpdatedAt, Expr::value(now))
        .filter(campaigns::Column::Id.eq(campaign.id.to_string()))
        .filter(campaigns::Column::Status.eq(CampaignStatus::Active.as_str()))
        .filter(campaigns::Column::CostPerSessionCents.eq(cost))
        .filter(
            Expr::col(campaigns::Column::SpentCents)
                .add(cost)
                .lte(Expr::col(campaigns::Column::BudgetCents)),
        );
    if campaign.max_sessions.is_some() {
        update = update.filter(
            Expr::col(campaigns::Column::SessionsGranted)
                .lt(Expr::col(campaigns::Column::MaxSessions)),
        );
    }
    let result = update.exec(conn).await?;
    Ok(result.rows_affected == 1)
}

/// Give back one session's worth of budget.
async fn release_budget<C: ConnectionTrait>(
    conn: &C,
    campaign_id: Uuid,
    amount_cents: i64,
    now: DateTime<Utc>,
) -> ResultEngine<()> {
    let result = campaigns::Entity::update_many()
        .col_expr(
            campaigns::Column::SpentCents,
            Expr::col(campaigns::Column::SpentCents).sub(amount_cents),
        )
        .col_expr(
            campaigns::Column::SessionsGranted,
            Expr::col(campaigns::Column::SessionsGranted).sub(1),
        )
        .col_expr(campaigns::Column::UpdatedAt, Expr::value(now))
        .filter(campaigns::Column::Id.eq(campaign_id.to_string()))
        .filter(campaigns::Column::SpentCents.gte(amount_cents))
        .filter(campaigns::Column::SessionsGranted.gte(1))
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        return Err(EngineError::Corrupted(format!(
            "campaign {campaign_id} counters are below the grant being reversed"
        )));
    }
    Ok(())
}

async fn evaluate_in_tx<C: ConnectionTrait>(
    conn: &C,
    session_id: Uuid,
    now: DateTime<Utc>,
) -> ResultEngine<Evaluation> {
    let session = load_session(conn, session_id).await?;
    let Some(ended_at) = session.session_end else {
        return Err(EngineError::InvalidSession(format!(
            "session {session_id} is still active"
        )));
    };
    if let Some(existing) = find_grant_for_session(conn, session_id).await? {
        return Ok(Evaluation::Existing(existing));
    }

    let duration_minutes = session
        .duration_minutes
        .unwrap_or_else(|| session.elapsed_minutes(ended_at));
    let facts = SessionFacts {
        driver_id: &session.driver_id,
        charger_id: session.charger_id.as_deref(),
        network: session.charger_network.as_deref(),
        zone: session.zone.as_deref(),
        location: session.location(),
        session_start: session.session_start,
        duration_minutes,
        power_kw: session.power_kw,
        connector_type: session.connector_type.as_deref(),
        prior_sessions: prior_sessions(conn, &session).await?,
    };

    for campaign in list_active_at(conn, ended_at).await? {
        if !campaign.rules.meets_min_duration(duration_minutes) {
            continue;
        }
        if let Some(mismatch) = campaign.rules.mismatch(&facts, campaign.timezone) {
            tracing::debug!(
                "session {session_id} skips campaign {}: {mismatch:?}",
                campaign.id
            );
            continue;
        }
        if !within_caps(conn, &campaign, &session, ended_at).await? {
            tracing::debug!(
                "session {session_id} skips campaign {}: driver cap reached",
                campaign.id
            );
            continue;
        }
        if !reserve_budget(conn, &campaign, now).await? {
            tracing::debug!(
                "campaign {} could not pay for session {session_id}",
                campaign.id
            );
            continue;
        }

        let reserved = load_campaign(conn, campaign.id).await?;
        if reserved.is_consumed()
            && set_status(
                conn,
                reserved.id,
                CampaignStatus::Active,
                CampaignStatus::Exhausted,
                None,
                now,
            )
            .await?
        {
            tracing::info!(
                "campaign {} exhausted: spent {} of {}, {} sessions",
                reserved.id,
                reserved.spent_cents,
                reserved.budget_cents,
                reserved.sessions_granted
            );
        }

        let mut grant = IncentiveGrant {
            id: Uuid::new_v4(),
            session_event_id: session.id,
            campaign_id: campaign.id,
            driver_id: session.driver_id.clone(),
            charger_id: session.charger_id.clone(),
            session_ended_at: ended_at,
            amount_cents: campaign.cost_per_session_cents,
            status: GrantStatus::Pending,
            idempotency_key: grant_idempotency_key(session.id),
            transaction_id: None,
            clawback_transaction_id: None,
            clawback_reason: None,
            clawed_back_at: None,
            created_at: now,
        };
        grants::ActiveModel::from(&grant).insert(conn).await?;

        let tx = record_in_tx(
            conn,
            RecordCmd::new(TransactionKind::CampaignGrant, grant.amount_cents)
                .destination(AccountRef::driver(grant.driver_id.clone()))
                .idempotency_key(grant.idempotency_key.clone())
                .correlation_id(session.id.to_string())
                .metadata(json!({
                    "campaign_id": campaign.id,
                    "grant_id": grant.id,
                })),
            now,
        )
        .await?;

        grant.status = GrantStatus::Granted;
        grant.transaction_id = Some(tx.id);
        grants::ActiveModel {
            id: ActiveValue::Unchanged(grant.id.to_string()),
            status: ActiveValue::Set(grant.status.as_str().to_string()),
            transaction_id: ActiveValue::Set(Some(tx.id.to_string())),
            ..Default::default()
        }
        .update(conn)
        .await?;

        return Ok(Evaluation::Issued(grant));
    }

    Ok(Evaluation::NoMatch)
}

/// Returns the grant and whether this call reversed it.
async fn clawback_in_tx<C: ConnectionTrait>(
    conn: &C,
    grant_id: Uuid,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> ResultEngine<(IncentiveGrant, bool)> {
    let mut grant = load_grant(conn, grant_id).await?;
    match grant.status {
        GrantStatus::ClawedBack => return Ok((grant, false)),
        GrantStatus::Pending => {
            return Err(EngineError::InvalidTransition(format!(
                "grant {grant_id} is not settled"
            )));
        }
        GrantStatus::Granted => {}
    }

    let claimed = grants::Entity::update_many()
        .col_expr(
            grants::Column::Status,
            Expr::value(GrantStatus::ClawedBack.as_str()),
        )
        .filter(grants::Column::Id.eq(grant_id.to_string()))
        .filter(grants::Column::Status.eq(GrantStatus::Granted.as_str()))
        .exec(conn)
        .await?;
    if claimed.rows_affected == 0 {
        let current = load_grant(conn, grant_id).await?;
        return Ok((current, false));
    }

    release_budget(conn, grant.campaign_id, grant.amount_cents, now).await?;
    let campaign = load_campaign(conn, grant.campaign_id).await?;
    if campaign.status == CampaignStatus::Exhausted
        && !campaign.is_consumed()
        && set_status(
            conn,
            campaign.id,
            CampaignStatus::Exhausted,
            CampaignStatus::Active,
            None,
            now,
        )
        .await?
    {
        tracing::info!("campaign {} reactivated by clawback", campaign.id);
    }

    let tx = record_in_tx(
        conn,
        RecordCmd::new(TransactionKind::CampaignClawback, grant.amount_cents)
            .source(AccountRef::driver(grant.driver_id.clone()))
            .idempotency_key(clawback_idempotency_key(grant.id))
            .correlation_id(grant.id.to_string())
            .metadata(json!({
                "campaign_id": grant.campaign_id,
                "session_event_id": grant.session_event_id,
                "reason": reason,
            })),
        now,
    )
    .await?;

    grant.status = GrantStatus::ClawedBack;
    grant.clawback_transaction_id = Some(tx.id);
    grant.clawback_reason = reason.clone();
    grant.clawed_back_at = Some(now);
    grants::ActiveModel {
        id: ActiveValue::Unchanged(grant.id.to_string()),
        clawback_transaction_id: ActiveValue::Set(Some(tx.id.to_string())),
        clawback_reason: ActiveValue::Set(grant.clawback_reason.clone()),
        clawed_back_at: ActiveValue::Set(grant.clawed_back_at),
        ..Default::default()
    }
    .update(conn)
    .await?;

    Ok((grant, true))
}

impl Engine {
    /// Reward a finalized session out of the best matching campaign.
    ///
    /// Returns `None` when no campaign matches. Calling it again for the same
    /// session returns the grant already issued (or `None` once clawed back).
    pub async fn evaluate_session(&self, session_id: Uuid) -> ResultEngine<Option<IncentiveGrant>> {
        let now = Utc::now();
        let outcome = with_tx!(self, |db_tx| evaluate_in_tx(&db_tx, session_id, now).await);
        self.settle_evaluation(session_id, outcome).await
    }

    /// An evaluation that lost the claim on the session returns the grant
    /// of the winner.
    async fn settle_evaluation(
        &self,
        session_id: Uuid,
        outcome: ResultEngine<Evaluation>,
    ) -> ResultEngine<Option<IncentiveGrant>> {
        match outcome {
            Ok(Evaluation::Issued(grant)) => {
                tracing::info!(
                    "granted {} cents to {} for session {} from campaign {}",
                    grant.amount_cents,
                    grant.driver_id,
                    grant.session_event_id,
                    grant.campaign_id
                );
                self.notify_grant(&grant).await;
                Ok(Some(grant))
            }
            Ok(Evaluation::Existing(grant)) => {
                Ok((grant.status != GrantStatus::ClawedBack).then_some(grant))
            }
            Ok(Evaluation::NoMatch) => {
                tracing::debug!("no campaign matches session {session_id}");
                Ok(None)
            }
            Err(EngineError::Database(err)) if is_unique_violation(&err) => {
                tracing::debug!("session {session_id} was claimed by a concurrent evaluation");
                Ok(find_grant_for_session(&self.database, session_id)
                    .await?
                    .filter(|grant| grant.status != GrantStatus::ClawedBack))
            }
            Err(err) => Err(err),
        }
    }

    /// Reverse a grant: refund the campaign budget and debit the driver.
    ///
    /// An exhausted campaign that can pay again goes back to `Active`.
    /// Clawing back a grant twice is a no-op.
    pub async fn clawback(&self, grant_id: Uuid, reason: &str) -> ResultEngine<IncentiveGrant> {
        let now = Utc::now();
        let reason = normalize_optional_text(Some(reason));
        let (grant, reversed) =
            with_tx!(self, |db_tx| clawback_in_tx(&db_tx, grant_id, reason, now).await)?;

        if reversed {
            tracing::info!(
                "clawed back grant {} ({} cents) from {}",
                grant.id,
                grant.amount_cents,
                grant.driver_id
            );
        }
        Ok(grant)
    }

    /// Return a grant by id.
    pub async fn grant(&self, grant_id: Uuid) -> ResultEngine<IncentiveGrant> {
        load_grant(&self.database, grant_id).await
    }

    /// Grant of a session, if any.
    pub async fn session_grant(&self, session_id: Uuid) -> ResultEngine<Option<IncentiveGrant>> {
        find_grant_for_session(&self.database, session_id).await
    }

    /// Newest first.
    pub async fn get_campaign_grants(&self, campaign_id: Uuid) -> ResultEngine<Vec<IncentiveGrant>> {
        grants::Entity::find()
            .filter(grants::Column::CampaignId.eq(campaign_id.to_string()))
            .order_by_desc(grants::Column::CreatedAt)
            .all(&self.database)
            .await?
            .into_iter()
            .map(IncentiveGrant::try_from)
            .collect()
    }

    /// Newest first.
    pub async fn get_driver_grants(&self, driver_id: &str) -> ResultEngine<Vec<IncentiveGrant>> {
        grants::Entity::find()
            .filter(grants::Column::DriverId.eq(driver_id))
            .order_by_desc(grants::Column::CreatedAt)
            .all(&self.database)
            .await?
            .into_iter()
            .map(IncentiveGrant::try_from)
            .collect()
    }

    async fn notify_grant(&self, grant: &IncentiveGrant) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        if let Err(err) = notifier.grant_issued(grant).await {
            tracing::warn!("grant {} notification failed: {err}", grant.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use migration::MigratorTrait;
    use sea_orm::Database;

    use super::*;
    use crate::{NewCampaignCmd, TelemetrySnapshot};

    async fn engine_with_db() -> Engine {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        migration::Migrator::up(&db, None).await.unwrap();
        Engine::builder().database(db).build().await.unwrap()
    }

    #[tokio::test]
    async fn claim_race_loser_returns_winner_grant() {
        let engine = engine_with_db().await;
        let campaign = engine
            .create_campaign(NewCampaignCmd::new(
                "Spring",
                "ACME Energy",
                10_000,
                500,
                Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            ))
            .await
            .unwrap();
        engine.activate_campaign(campaign.id).await.unwrap();

        let start = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        engine
            .poll("alice", TelemetrySnapshot::new(true, start).energy(0.0).power(11.0))
            .await
            .unwrap();
        let ended = engine
            .poll(
                "alice",
                TelemetrySnapshot::new(false, start + Duration::minutes(20)).energy(3.0),
            )
            .await
            .unwrap();
        let session_id = ended.session_id.unwrap();
        let winner = engine.grant(ended.grant_id.unwrap()).await.unwrap();
        let campaign = engine.campaign(campaign.id).await.unwrap();

        // The loser reserved budget before the winner's claim was visible.
        let loser = IncentiveGrant {
            id: Uuid::new_v4(),
            status: GrantStatus::Pending,
            transaction_id: None,
            ..winner.clone()
        };
        let db_tx = engine.database.begin().await.unwrap();
        assert!(reserve_budget(&db_tx, &campaign, Utc::now()).await.unwrap());
        let outcome = grants::ActiveModel::from(&loser)
            .insert(&db_tx)
            .await
            .map(|_| Evaluation::Issued(loser.clone()))
            .map_err(EngineError::from);
        db_tx.rollback().await.unwrap();
        assert!(matches!(
            &outcome,
            Err(EngineError::Database(err)) if is_unique_violation(err)
        ));

        let settled = engine
            .settle_evaluation(session_id, outcome)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.id, winner.id);
        assert_eq!(settled.status, GrantStatus::Granted);

        let campaign = engine.campaign(campaign.id).await.unwrap();
        assert_eq!(campaign.spent_cents, 500);
        assert_eq!(campaign.sessions_granted, 1);
        assert_eq!(
            engine.get_balance(&AccountRef::driver("alice")).await.unwrap(),
            500
        );
    }

    #[test]
    fn local_day_follows_campaign_timezone() {
        // 23:30 UTC on May 1st is already May 2nd in Rome (UTC+2).
        let at = Utc.with_ymd_and_hms(2026, 5, 1, 23, 30, 0).unwrap();
        let (start, end) = local_day_bounds(chrono_tz::Europe::Rome, at);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 5, 1, 22, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 5, 2, 22, 0, 0).unwrap());

        let (start, end) = local_day_bounds(Tz::UTC, at);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 5, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn local_day_spans_dst_change() {
        // Rome switches to summer time on 2026-03-29, a 23-hour day.
        let at = Utc.with_ymd_and_hms(2026, 3, 29, 12, 0, 0).unwrap();
        let (start, end) = local_day_bounds(chrono_tz::Europe::Rome, at);
        assert_eq!((end - start).num_hours(), 23);
    }
}
