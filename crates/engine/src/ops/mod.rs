use std::{fmt, sync::Arc, time::Duration};

use dashmap::DashMap;
use sea_orm::DatabaseConnection;
use tokio::sync::Mutex;

use crate::{
    ChargerDirectory, GrantNotifier, MemoryPollCache, PollCache, ResultEngine, TelemetryProvider,
};

mod accounts;
mod campaigns;
mod incentives;
mod ledger;
mod sessions;

pub use ledger::Reconciliation;

/// Run a block inside a DB transaction, committing on success and rolling back on error.
macro_rules! with_tx {
    ($self:expr, |$tx:ident| $body:expr) => {{
        let $tx = $self.database.begin().await?;
        let result = $body;
        match result {
            Ok(value) => {
                $tx.commit().await?;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }};
}

pub(crate) use with_tx;

/// Tunable constants of the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// An active session without telemetry for this long is finalized by the sweep.
    pub stale_session_after: Duration,
    /// Lifetime of a cached poll status, whole seconds.
    pub poll_cache_ttl: Duration,
    pub poll_cache_capacity: usize,
    pub charger_match_radius_m: f64,
    /// Most recent points kept in a session's location trail.
    pub location_trail_limit: usize,
    pub telemetry_retry_attempts: u32,
    /// Delay before the first retry; doubled on every further attempt.
    pub telemetry_retry_base_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_session_after: Duration::from_secs(5 * 60),
            poll_cache_ttl: Duration::from_secs(15),
            poll_cache_capacity: 10_000,
            charger_match_radius_m: 150.0,
            location_trail_limit: 20,
            telemetry_retry_attempts: 3,
            telemetry_retry_base_delay: Duration::from_millis(250),
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    database: DatabaseConnection,
    config: EngineConfig,
    poll_cache: Arc<dyn PollCache>,
    telemetry: Option<Arc<dyn TelemetryProvider>>,
    chargers: Option<Arc<dyn ChargerDirectory>>,
    notifier: Option<Arc<dyn GrantNotifier>>,
    driver_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("telemetry", &self.telemetry.is_some())
            .field("chargers", &self.chargers.is_some())
            .field("notifier", &self.notifier.is_some())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Return a builder for `Engine`. Help to build the struct.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Lock serializing session work for one driver.
    fn driver_lock(&self, driver_id: &str) -> Arc<Mutex<()>> {
        self.driver_locks
            .entry(driver_id.to_string())
            .or_default()
            .clone()
    }
}

/// The builder for `Engine`
#[derive(Default)]
pub struct EngineBuilder {
    database: DatabaseConnection,
    config: Option<EngineConfig>,
    poll_cache: Option<Arc<dyn PollCache>>,
    telemetry: Option<Arc<dyn TelemetryProvider>>,
    chargers: Option<Arc<dyn ChargerDirectory>>,
    notifier: Option<Arc<dyn GrantNotifier>>,
}

impl EngineBuilder {
    /// Pass the required database
    pub fn database(mut self, db: DatabaseConnection) -> EngineBuilder {
        self.database = db;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> EngineBuilder {
        self.config = Some(config);
        self
    }

    /// Replace the in-process poll cache, e.g. with a shared one.
    pub fn poll_cache(mut self, cache: Arc<dyn PollCache>) -> EngineBuilder {
        self.poll_cache = Some(cache);
        self
    }

    pub fn telemetry(mut self, provider: Arc<dyn TelemetryProvider>) -> EngineBuilder {
        self.telemetry = Some(provider);
        self
    }

    pub fn chargers(mut self, directory: Arc<dyn ChargerDirectory>) -> EngineBuilder {
        self.chargers = Some(directory);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn GrantNotifier>) -> EngineBuilder {
        self.notifier = Some(notifier);
        self
    }

    /// Construct `Engine`
    pub async fn build(self) -> ResultEngine<Engine> {
        let config = self.config.unwrap_or_default();
        let poll_cache = self
            .poll_cache
            .unwrap_or_else(|| {
                Arc::new(MemoryPollCache::new(
                    config.poll_cache_capacity,
                    config.poll_cache_ttl,
                ))
            });
        Ok(Engine {
            database: self.database,
            config,
            poll_cache,
            telemetry: self.telemetry,
            chargers: self.chargers,
            notifier: self.notifier,
            driver_locks: Arc::new(DashMap::new()),
        })
    }
}
