use std::time::Duration;

use chrono::Utc;
use migration::{Migrator, MigratorTrait};
use settings::Database;

mod settings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let settings = settings::Settings::new()?;

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "chargepoints={level},engine={level},migration={level}",
            level = settings.app.level
        ))
        .init();

    let db = parse_database(&settings.database).await?;
    let engine = engine::Engine::builder()
        .database(db)
        .config((&settings.engine).into())
        .build()
        .await?;
    tracing::info!("engine ready: {:?}", engine.config());

    let mut ticker =
        tokio::time::interval(Duration::from_secs(settings.maintenance.interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => run_maintenance(&engine).await,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Finalize silent sessions and close campaigns past their end date.
async fn run_maintenance(engine: &engine::Engine) {
    let now = Utc::now();
    match engine.sweep_stale_sessions(now).await {
        Ok(ended) if !ended.is_empty() => {
            tracing::info!("swept {} stale sessions", ended.len());
        }
        Ok(_) => {}
        Err(err) => tracing::error!("stale session sweep failed: {err}"),
    }
    match engine.expire_campaigns(now).await {
        Ok(expired) if !expired.is_empty() => {
            tracing::info!("completed {} expired campaigns", expired.len());
        }
        Ok(_) => {}
        Err(err) => tracing::error!("campaign expiry failed: {err}"),
    }
}

async fn parse_database(
    config: &settings::Database,
) -> Result<sea_orm::DatabaseConnection, Box<dyn std::error::Error + Send + Sync>> {
    let url = match config {
        Database::Memory => String::from("sqlite::memory:"),
        Database::Sqlite(path) => format!("sqlite:{}?mode=rwc", path),
    };

    let database = sea_orm::Database::connect(url).await?;
    Migrator::up(&database, None).await?;
    Ok(database)
}
