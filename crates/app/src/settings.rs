//! Handles settings for the application. Configuration is written in
//! `settings.toml` and every key can be overridden from the environment
//! with the `CHARGEPOINTS__` prefix.
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use engine::EngineConfig;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct App {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for App {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    String::from("info")
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Database {
    #[default]
    Memory,
    Sqlite(String),
}

/// Overrides for the engine tunables; missing keys keep the engine default.
#[derive(Debug, Default, Deserialize)]
pub struct Engine {
    pub stale_session_after_secs: Option<u64>,
    pub poll_cache_ttl_secs: Option<u64>,
    pub poll_cache_capacity: Option<usize>,
    pub charger_match_radius_m: Option<f64>,
    pub location_trail_limit: Option<usize>,
    pub telemetry_retry_attempts: Option<u32>,
    pub telemetry_retry_base_delay_ms: Option<u64>,
}

impl From<&Engine> for EngineConfig {
    fn from(value: &Engine) -> Self {
        let default = EngineConfig::default();
        Self {
            stale_session_after: value
                .stale_session_after_secs
                .map_or(default.stale_session_after, Duration::from_secs),
            poll_cache_ttl: value
                .poll_cache_ttl_secs
                .map_or(default.poll_cache_ttl, Duration::from_secs),
            poll_cache_capacity: value
                .poll_cache_capacity
                .unwrap_or(default.poll_cache_capacity),
            charger_match_radius_m: value
                .charger_match_radius_m
                .unwrap_or(default.charger_match_radius_m),
            location_trail_limit: value
                .location_trail_limit
                .unwrap_or(default.location_trail_limit),
            telemetry_retry_attempts: value
                .telemetry_retry_attempts
                .unwrap_or(default.telemetry_retry_attempts),
            telemetry_retry_base_delay: value
                .telemetry_retry_base_delay_ms
                .map_or(default.telemetry_retry_base_delay, Duration::from_millis),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Maintenance {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

impl Default for Maintenance {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
        }
    }
}

fn default_interval() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub app: App,
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub maintenance: Maintenance,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name("settings").required(false))
            .add_source(Environment::with_prefix("CHARGEPOINTS").separator("__"))
            .build()?;

        settings.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_engine_keys_keep_defaults() {
        let overrides = Engine {
            poll_cache_ttl_secs: Some(30),
            ..Engine::default()
        };
        let config = EngineConfig::from(&overrides);
        assert_eq!(config.poll_cache_ttl, Duration::from_secs(30));
        assert_eq!(
            config.stale_session_after,
            EngineConfig::default().stale_session_after
        );
    }

    #[test]
    fn database_reads_sqlite_path() {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(
                "[database]\nsqlite = \"./test.db\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert!(matches!(settings.database, Database::Sqlite(path) if path == "./test.db"));
        assert_eq!(settings.maintenance.interval_secs, 60);
        assert_eq!(settings.app.level, "info");
    }
}
