use chrono::{DateTime, Utc};
use sea_orm::{
    ConnectionTrait, QueryFilter, QueryOrder, QuerySelect, TransactionTrait, prelude::*,
};
use uuid::Uuid;

use crate::{
    EndedReason, EngineError, GrantStatus, LocationPoint, PollStatus, ResultEngine, SessionEvent,
    TelemetrySnapshot, sessions,
    util::{is_unique_violation, normalize_required_text},
};

use super::{Engine, with_tx};

pub(super) async fn load_session<C: ConnectionTrait>(
    conn: &C,
    session_id: Uuid,
) -> ResultEngine<SessionEvent> {
    let model = sessions::Entity::find_by_id(session_id.to_string())
        .one(conn)
        .await?
        .ok_or_else(|| EngineError::KeyNotFound(format!("session {session_id} not exists")))?;
    SessionEvent::try_from(model)
}

async fn find_active<C: ConnectionTrait>(
    conn: &C,
    driver_id: &str,
) -> ResultEngine<Option<SessionEvent>> {
    sessions::Entity::find()
        .filter(sessions::Column::DriverId.eq(driver_id))
        .filter(sessions::Column::SessionEnd.is_null())
        .order_by_desc(sessions::Column::SessionStart)
        .one(conn)
        .await?
        .map(SessionEvent::try_from)
        .transpose()
}

async fn find_by_source<C: ConnectionTrait>(
    conn: &C,
    verification_source: &str,
    source_session_id: &str,
) -> ResultEngine<Option<SessionEvent>> {
    sessions::Entity::find()
        .filter(sessions::Column::VerificationSource.eq(verification_source))
        .filter(sessions::Column::SourceSessionId.eq(source_session_id))
        .one(conn)
        .await?
        .map(SessionEvent::try_from)
        .transpose()
}

/// Columns a poll may change. Identity fields stay `NotSet`.
fn telemetry_model(session: &SessionEvent) -> ResultEngine<sessions::ActiveModel> {
    let full = sessions::ActiveModel::try_from(session)?;
    Ok(sessions::ActiveModel {
        power_kw: full.power_kw,
        session_end: full.session_end,
        duration_minutes: full.duration_minutes,
        kwh_delivered: full.kwh_delivered,
        quality_score: full.quality_score,
        ended_reason: full.ended_reason,
        battery_end_pct: full.battery_end_pct,
        location_trail: full.location_trail,
        last_update_at: full.last_update_at,
        ..Default::default()
    })
}

/// Write telemetry of a session iff it is still active.
async fn save_if_active<C: ConnectionTrait>(conn: &C, session: &SessionEvent) -> ResultEngine<bool> {
    let result = sessions::Entity::update_many()
        .set(telemetry_model(session)?)
        .filter(sessions::Column::Id.eq(session.id.to_string()))
        .filter(sessions::Column::SessionEnd.is_null())
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

impl SessionEvent {
    fn apply_snapshot(&mut self, snapshot: &TelemetrySnapshot, trail_limit: usize) {
        if let Some(kwh) = snapshot.energy_delivered_kwh {
            self.kwh_delivered = self.kwh_delivered.max(kwh);
        }
        if let Some(power) = snapshot.power_kw {
            self.power_kw = Some(self.power_kw.map_or(power, |peak| peak.max(power)));
        }
        if snapshot.battery_pct.is_some() {
            self.battery_end_pct = snapshot.battery_pct;
        }
        if let (Some(lat), Some(lng)) = (snapshot.lat, snapshot.lng) {
            self.push_location(
                LocationPoint {
                    lat,
                    lng,
                    at: snapshot.observed_at,
                },
                trail_limit,
            );
        }
        self.last_update_at = self.last_update_at.max(snapshot.observed_at);
    }
}

impl Engine {
    /// Feed one telemetry snapshot into the driver's session state machine.
    ///
    /// Charging with no active session opens one; charging with an active
    /// session updates its telemetry; not charging finalizes the active
    /// session and evaluates it for a grant.
    pub async fn poll(&self, driver_id: &str, snapshot: TelemetrySnapshot) -> ResultEngine<PollStatus> {
        let driver_id = normalize_required_text(driver_id, "driver_id")?;
        let lock = self.driver_lock(&driver_id);
        let _guard = lock.lock().await;
        self.poll_locked(&driver_id, snapshot).await
    }

    /// Poll the vehicle through the telemetry provider.
    ///
    /// A cached status is served while fresh. Transient provider errors are
    /// retried with exponential backoff; once retries run out the cycle
    /// counts as no signal and the session is left untouched.
    pub async fn poll_vehicle(
        &self,
        driver_id: &str,
        vehicle_ref: &str,
        now: DateTime<Utc>,
    ) -> ResultEngine<PollStatus> {
        let driver_id = normalize_required_text(driver_id, "driver_id")?;
        let lock = self.driver_lock(&driver_id);
        let _guard = lock.lock().await;

        if let Some(cached) = self.poll_cache.get(&driver_id).await {
            tracing::debug!("poll cache hit for {driver_id}");
            return Ok(cached);
        }

        let Some(provider) = self.telemetry.clone() else {
            return Err(EngineError::UpstreamTelemetryUnavailable(
                "no telemetry provider configured".to_string(),
            ));
        };

        let attempts = self.config.telemetry_retry_attempts.max(1);
        let mut delay = self.config.telemetry_retry_base_delay;
        for attempt in 1..=attempts {
            match provider.poll(vehicle_ref).await {
                Ok(reading) => {
                    let snapshot = reading.into_snapshot(vehicle_ref, now);
                    return self.poll_locked(&driver_id, snapshot).await;
                }
                Err(err) if err.is_transient() => {
                    tracing::debug!(
                        "telemetry attempt {attempt}/{attempts} for {vehicle_ref} failed: {err}"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
                Err(err) => {
                    return Err(EngineError::UpstreamTelemetryUnavailable(err.to_string()));
                }
            }
        }

        tracing::warn!("no telemetry for {vehicle_ref} after {attempts} attempts, skipping cycle");
        Ok(match find_active(&self.database, &driver_id).await? {
            Some(session) => PollStatus::active(&session, now),
            None => PollStatus::idle(),
        })
    }

    /// Manually end the driver's active session.
    pub async fn stop_session(&self, driver_id: &str, now: DateTime<Utc>) -> ResultEngine<PollStatus> {
        let driver_id = normalize_required_text(driver_id, "driver_id")?;
        let lock = self.driver_lock(&driver_id);
        let _guard = lock.lock().await;

        let Some(session) = find_active(&self.database, &driver_id).await? else {
            return Ok(PollStatus::idle());
        };
        self.end_session(session, now, EndedReason::ManualStop).await
    }

    /// Finalize active sessions with no telemetry for longer than the
    /// staleness window. The session ends at its last update.
    pub async fn sweep_stale_sessions(&self, now: DateTime<Utc>) -> ResultEngine<Vec<Uuid>> {
        let window = chrono::Duration::from_std(self.config.stale_session_after)
            .map_err(|err| EngineError::InvalidSession(format!("invalid staleness window: {err}")))?;
        let cutoff = now - window;
        let stale = sessions::Entity::find()
            .filter(sessions::Column::SessionEnd.is_null())
            .filter(sessions::Column::LastUpdateAt.lt(cutoff))
            .order_by_asc(sessions::Column::LastUpdateAt)
            .all(&self.database)
            .await?;

        let mut finalized = Vec::with_capacity(stale.len());
        for model in stale {
            let candidate = SessionEvent::try_from(model)?;
            let lock = self.driver_lock(&candidate.driver_id);
            let _guard = lock.lock().await;

            // A poll may have refreshed or ended it while we waited.
            let session = load_session(&self.database, candidate.id).await?;
            if !session.is_active() || session.last_update_at >= cutoff {
                continue;
            }
            let ended_at = session.last_update_at;
            let status = self
                .end_session(session, ended_at, EndedReason::StaleCleanup)
                .await?;
            if let Some(id) = status.session_id {
                finalized.push(id);
            }
        }
        if !finalized.is_empty() {
            tracing::info!("stale sweep finalized {} sessions", finalized.len());
        }
        Ok(finalized)
    }

    /// The driver's active session, if any.
    pub async fn active_session(&self, driver_id: &str) -> ResultEngine<Option<SessionEvent>> {
        find_active(&self.database, driver_id).await
    }

    /// Return a session by id.
    pub async fn session(&self, session_id: Uuid) -> ResultEngine<SessionEvent> {
        load_session(&self.database, session_id).await
    }

    /// Newest first.
    pub async fn get_driver_sessions(
        &self,
        driver_id: &str,
        limit: u64,
    ) -> ResultEngine<Vec<SessionEvent>> {
        sessions::Entity::find()
            .filter(sessions::Column::DriverId.eq(driver_id))
            .order_by_desc(sessions::Column::SessionStart)
            .limit(limit)
            .all(&self.database)
            .await?
            .into_iter()
            .map(SessionEvent::try_from)
            .collect()
    }

    /// State machine step. The caller holds the driver lock.
    async fn poll_locked(&self, driver_id: &str, snapshot: TelemetrySnapshot) -> ResultEngine<PollStatus> {
        let active = find_active(&self.database, driver_id).await?;
        match (snapshot.charging, active) {
            (true, None) => self.start_session(driver_id, &snapshot).await,
            (true, Some(mut session)) => {
                session.apply_snapshot(&snapshot, self.config.location_trail_limit);
                self.refresh_session(session, snapshot.observed_at).await
            }
            (false, Some(mut session)) => {
                session.apply_snapshot(&snapshot, self.config.location_trail_limit);
                self.end_session(session, snapshot.observed_at, EndedReason::ChargingStopped)
                    .await
            }
            (false, None) => {
                self.poll_cache.expire(driver_id).await;
                Ok(PollStatus::idle())
            }
        }
    }

    async fn start_session(&self, driver_id: &str, snapshot: &TelemetrySnapshot) -> ResultEngine<PollStatus> {
        let charger = match (&self.chargers, snapshot.lat, snapshot.lng) {
            (Some(directory), Some(lat), Some(lng)) => {
                directory
                    .nearest_charger(lat, lng, self.config.charger_match_radius_m)
                    .await
            }
            _ => None,
        };

        let now = Utc::now();
        let mut session = SessionEvent {
            id: Uuid::new_v4(),
            driver_id: driver_id.to_string(),
            vehicle_ref: snapshot.vehicle_ref.clone(),
            charger_id: charger.as_ref().map(|c| c.id.clone()),
            charger_network: charger.as_ref().and_then(|c| c.network.clone()),
            zone: charger.as_ref().and_then(|c| c.zone.clone()),
            connector_type: snapshot.connector_type.clone(),
            power_kw: None,
            session_start: snapshot.observed_at,
            session_end: None,
            duration_minutes: None,
            kwh_delivered: 0.0,
            verification_source: snapshot.verification_source.clone(),
            verification_method: snapshot.verification_method.clone(),
            verified: snapshot.verified,
            source_session_id: snapshot.source_session_id.clone(),
            quality_score: None,
            ended_reason: None,
            start_lat: snapshot.lat,
            start_lng: snapshot.lng,
            battery_start_pct: snapshot.battery_pct,
            battery_end_pct: None,
            location_trail: Vec::new(),
            last_update_at: snapshot.observed_at,
            created_at: now,
        };
        session.apply_snapshot(snapshot, self.config.location_trail_limit);

        let inserted = with_tx!(self, |db_tx| {
            let model = sessions::ActiveModel::try_from(&session)?;
            model.insert(&db_tx).await.map_err(EngineError::from)
        });
        match inserted {
            Ok(_) => {}
            Err(EngineError::Database(err)) if is_unique_violation(&err) => {
                // The upstream session is already recorded.
                let source_id = session.source_session_id.as_deref().unwrap_or_default();
                let Some(existing) =
                    find_by_source(&self.database, &session.verification_source, source_id).await?
                else {
                    return Err(EngineError::Database(err));
                };
                return self.status_of(existing, snapshot.observed_at).await;
            }
            Err(err) => return Err(err),
        }

        tracing::info!(
            "session {} started for {driver_id} at charger {}",
            session.id,
            session.charger_id.as_deref().unwrap_or("unknown")
        );
        let status = PollStatus::active(&session, snapshot.observed_at);
        self.cache_status(driver_id, &status).await;
        Ok(status)
    }

    /// Persist fresh telemetry of an active session. A session finalized
    /// in the meantime is reported as stored.
    async fn refresh_session(&self, session: SessionEvent, at: DateTime<Utc>) -> ResultEngine<PollStatus> {
        let saved = with_tx!(self, |db_tx| save_if_active(&db_tx, &session).await)?;
        if !saved {
            self.poll_cache.expire(&session.driver_id).await;
            let current = load_session(&self.database, session.id).await?;
            return self.status_of(current, at).await;
        }
        let status = PollStatus::active(&session, at);
        self.cache_status(&session.driver_id, &status).await;
        Ok(status)
    }

    /// Finalize, persist, then evaluate the session for a grant.
    ///
    /// Evaluation runs in its own unit of work: when it fails the session
    /// stays finalized and can be evaluated again later.
    async fn end_session(
        &self,
        mut session: SessionEvent,
        ended_at: DateTime<Utc>,
        reason: EndedReason,
    ) -> ResultEngine<PollStatus> {
        session.finalize(ended_at, reason);
        let saved = with_tx!(self, |db_tx| save_if_active(&db_tx, &session).await)?;
        self.poll_cache.expire(&session.driver_id).await;
        if !saved {
            let current = load_session(&self.database, session.id).await?;
            return self.status_of(current, ended_at).await;
        }

        tracing::info!(
            "session {} of {} ended ({}): {} min, {:.2} kWh, quality {}",
            session.id,
            session.driver_id,
            reason.as_str(),
            session.duration_minutes.unwrap_or_default(),
            session.kwh_delivered,
            session.quality_score.unwrap_or_default()
        );

        let grant_id = match self.evaluate_session(session.id).await {
            Ok(grant) => grant.map(|g| g.id),
            Err(err) => {
                tracing::warn!("evaluation of session {} failed: {err}", session.id);
                None
            }
        };
        Ok(PollStatus::ended(&session, grant_id))
    }

    async fn status_of(&self, session: SessionEvent, at: DateTime<Utc>) -> ResultEngine<PollStatus> {
        if session.is_active() {
            return Ok(PollStatus::active(&session, at));
        }
        let grant = self.session_grant(session.id).await?;
        let grant_id = grant
            .filter(|g| g.status == GrantStatus::Granted)
            .map(|g| g.id);
        Ok(PollStatus::ended(&session, grant_id))
    }

    async fn cache_status(&self, driver_id: &str, status: &PollStatus) {
        self.poll_cache.set(driver_id, status.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use migration::MigratorTrait;
    use sea_orm::{ActiveValue, Database};

    use super::*;

    async fn engine_with_db() -> Engine {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        migration::Migrator::up(&db, None).await.unwrap();
        Engine::builder().database(db).build().await.unwrap()
    }

    fn active_session(start: DateTime<Utc>) -> SessionEvent {
        SessionEvent {
            id: Uuid::new_v4(),
            driver_id: "alice".to_string(),
            vehicle_ref: Some("car-1".to_string()),
            charger_id: Some("ch-1".to_string()),
            charger_network: None,
            zone: None,
            connector_type: None,
            power_kw: Some(7.0),
            session_start: start,
            session_end: None,
            duration_minutes: None,
            kwh_delivered: 1.0,
            verification_source: "telemetry".to_string(),
            verification_method: "vehicle_poll".to_string(),
            verified: true,
            source_session_id: None,
            quality_score: None,
            ended_reason: None,
            start_lat: Some(45.0),
            start_lng: Some(9.0),
            battery_start_pct: Some(40.0),
            battery_end_pct: Some(40.0),
            location_trail: Vec::new(),
            last_update_at: start,
            created_at: start,
        }
    }

    #[test]
    fn snapshot_updates_telemetry_only() {
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        let mut session = active_session(start);
        let snapshot = TelemetrySnapshot::new(true, start + chrono::Duration::minutes(3))
            .energy(2.5)
            .power(11.0)
            .battery(48.0)
            .location(45.1, 9.1);
        session.apply_snapshot(&snapshot, 20);

        assert_eq!(session.kwh_delivered, 2.5);
        assert_eq!(session.power_kw, Some(11.0));
        assert_eq!(session.battery_end_pct, Some(48.0));
        assert_eq!(session.location_trail.len(), 1);
        assert_eq!(session.last_update_at, snapshot.observed_at);
        assert_eq!(session.charger_id.as_deref(), Some("ch-1"));
        assert_eq!(session.start_lat, Some(45.0));
        assert_eq!(session.session_start, start);
    }

    #[test]
    fn lower_power_keeps_peak() {
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        let mut session = active_session(start);
        session.apply_snapshot(&TelemetrySnapshot::new(true, start).power(3.0), 20);
        assert_eq!(session.power_kw, Some(7.0));
    }

    #[test]
    fn telemetry_model_leaves_identity_unset() {
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        let model = telemetry_model(&active_session(start)).unwrap();
        assert!(matches!(model.driver_id, ActiveValue::NotSet));
        assert!(matches!(model.charger_id, ActiveValue::NotSet));
        assert!(matches!(model.session_start, ActiveValue::NotSet));
        assert!(matches!(model.kwh_delivered, ActiveValue::Set(_)));
    }

    #[tokio::test]
    async fn refresh_reports_session_finalized_meanwhile() {
        let engine = engine_with_db().await;
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        let session = active_session(start);
        sessions::ActiveModel::try_from(&session)
            .unwrap()
            .insert(&engine.database)
            .await
            .unwrap();

        let mut ended = session.clone();
        ended.finalize(start + chrono::Duration::minutes(30), EndedReason::ManualStop);
        assert!(save_if_active(&engine.database, &ended).await.unwrap());

        let mut stale = session.clone();
        let at = start + chrono::Duration::minutes(31);
        stale.apply_snapshot(&TelemetrySnapshot::new(true, at).energy(9.0), 20);
        let status = engine.refresh_session(stale, at).await.unwrap();

        assert!(!status.active);
        assert_eq!(status.session_id, Some(session.id));
        assert_eq!(status.duration_minutes, Some(30));
        let stored = engine.session(session.id).await.unwrap();
        assert_eq!(stored.kwh_delivered, 1.0);
        assert_eq!(stored.ended_reason, Some(EndedReason::ManualStop));
    }
}
