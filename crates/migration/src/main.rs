//! Schema tool for the points ledger database: accounts, transactions,
//! campaigns, session_events and incentive_grants.
//!
//! `DATABASE_URL` selects the database; `down` takes an optional step count.

use sea_orm::Database;
use sea_orm_migration::prelude::*;

const DEFAULT_DATABASE_URL: &str = "sqlite:./chargepoints.db?mode=rwc";
const USAGE: &str = "Usage: cargo run -p migration -- [up|down [steps]|fresh|status]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut args = std::env::args().skip(1);
    let cmd = args.next().unwrap_or_else(|| "up".to_string());

    let db_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
    let db = Database::connect(&db_url).await?;

    match cmd.as_str() {
        "up" => {
            migration::Migrator::up(&db, None).await?;
            println!("ledger schema is up to date");
        }
        "down" => {
            let steps = match args.next() {
                Some(raw) => Some(raw.parse::<u32>()?),
                None => Some(1),
            };
            migration::Migrator::down(&db, steps).await?;
        }
        "fresh" => {
            migration::Migrator::fresh(&db).await?;
            println!("ledger schema recreated, all points and campaigns dropped");
        }
        "status" => migration::Migrator::status(&db).await?,
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}
