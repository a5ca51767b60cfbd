use std::error::Error;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use engine::{
    AccountRef, Campaign, CampaignStatus, DriverCaps, Engine, NewCampaignCmd, TargetingRules,
};
use migration::MigratorTrait;
use sea_orm::{Database, DatabaseConnection};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "chargepoints_admin")]
#[command(about = "Admin utilities for chargepoints (campaigns, balances, maintenance)")]
struct Cli {
    /// Database connection string (also read from `DATABASE_URL`).
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "sqlite:./chargepoints.db?mode=rwc"
    )]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Campaign(CampaignArgs),
    Account(AccountArgs),
    /// Reverse an incentive grant.
    Clawback {
        grant_id: Uuid,
        #[arg(long)]
        reason: String,
    },
    /// Finalize stale sessions and complete expired campaigns now.
    Sweep,
}

#[derive(Args, Debug)]
struct CampaignArgs {
    #[command(subcommand)]
    command: CampaignCommand,
}

#[derive(Subcommand, Debug)]
enum CampaignCommand {
    Create(CampaignCreateArgs),
    /// Start a draft campaign. Paused campaigns use `resume`.
    Activate { id: Uuid },
    Pause {
        id: Uuid,
        #[arg(long, default_value = "paused by admin")]
        reason: String,
    },
    Resume { id: Uuid },
    Complete { id: Uuid },
    Cancel { id: Uuid },
    Show { id: Uuid },
    List {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
    },
}

#[derive(Args, Debug)]
struct CampaignCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    sponsor: String,
    #[arg(long)]
    budget_cents: i64,
    #[arg(long)]
    cost_cents: i64,
    /// RFC 3339; defaults to now.
    #[arg(long)]
    start: Option<DateTime<Utc>>,
    #[arg(long)]
    end: Option<DateTime<Utc>>,
    #[arg(long, default_value_t = 100)]
    priority: i32,
    #[arg(long)]
    max_sessions: Option<i64>,
    #[arg(long)]
    timezone: Option<String>,
    /// Targeting rules as JSON, e.g. `{"zones":["downtown"]}`.
    #[arg(long)]
    rules: Option<String>,
    #[arg(long)]
    daily_cap: Option<i32>,
    #[arg(long)]
    lifetime_cap: Option<i32>,
    #[arg(long)]
    per_charger_cap: Option<i32>,
}

#[derive(Args, Debug)]
struct AccountArgs {
    #[command(subcommand)]
    command: AccountCommand,
}

#[derive(Subcommand, Debug)]
enum AccountCommand {
    Balance(AccountTarget),
    Reconcile(AccountTarget),
    History {
        #[command(flatten)]
        target: AccountTarget,
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
}

#[derive(Args, Debug)]
struct AccountTarget {
    /// Driver id; mutually exclusive with `--merchant`.
    #[arg(long, conflicts_with = "merchant", required_unless_present = "merchant")]
    driver: Option<String>,
    #[arg(long)]
    merchant: Option<String>,
}

impl AccountTarget {
    fn account_ref(&self) -> AccountRef {
        match &self.driver {
            Some(driver) => AccountRef::driver(driver),
            None => AccountRef::merchant(self.merchant.clone().unwrap_or_default()),
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatusArg {
    Draft,
    Active,
    Paused,
    Exhausted,
    Completed,
    Canceled,
}

impl From<StatusArg> for CampaignStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Draft => Self::Draft,
            StatusArg::Active => Self::Active,
            StatusArg::Paused => Self::Paused,
            StatusArg::Exhausted => Self::Exhausted,
            StatusArg::Completed => Self::Completed,
            StatusArg::Canceled => Self::Canceled,
        }
    }
}

fn print_campaign(campaign: &Campaign) {
    println!(
        "{} {:<10} p{:<4} {}/{} cents ({} sessions) {}",
        campaign.id,
        campaign.status.as_str(),
        campaign.priority,
        campaign.spent_cents,
        campaign.budget_cents,
        campaign.sessions_granted,
        campaign.name
    );
}

async fn connect_db(
    database_url: &str,
) -> Result<DatabaseConnection, Box<dyn Error + Send + Sync>> {
    let db = Database::connect(database_url).await?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

async fn create_campaign(
    engine: &Engine,
    args: CampaignCreateArgs,
) -> Result<Campaign, Box<dyn Error + Send + Sync>> {
    let rules: TargetingRules = match args.rules.as_deref() {
        Some(raw) => serde_json::from_str(raw)?,
        None => TargetingRules::default(),
    };
    let mut cmd = NewCampaignCmd::new(
        args.name,
        args.sponsor,
        args.budget_cents,
        args.cost_cents,
        args.start.unwrap_or_else(Utc::now),
    )
    .priority(args.priority)
    .rules(rules)
    .caps(DriverCaps {
        daily: args.daily_cap,
        lifetime: args.lifetime_cap,
        per_charger: args.per_charger_cap,
    });
    if let Some(end) = args.end {
        cmd = cmd.end_date(end);
    }
    if let Some(max) = args.max_sessions {
        cmd = cmd.max_sessions(max);
    }
    if let Some(tz) = args.timezone {
        cmd = cmd.timezone(tz);
    }
    Ok(engine.create_campaign(cmd).await?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();

    let db = connect_db(&cli.database_url).await?;
    let engine = Engine::builder().database(db).build().await?;

    match cli.command {
        Command::Campaign(CampaignArgs { command }) => match command {
            CampaignCommand::Create(args) => {
                let campaign = create_campaign(&engine, args).await?;
                println!("created campaign: {} ({})", campaign.name, campaign.id);
            }
            CampaignCommand::Activate { id } => {
                print_campaign(&engine.activate_campaign(id).await?);
            }
            CampaignCommand::Pause { id, reason } => {
                print_campaign(&engine.pause_campaign(id, &reason).await?);
            }
            CampaignCommand::Resume { id } => {
                print_campaign(&engine.resume_campaign(id).await?);
            }
            CampaignCommand::Complete { id } => {
                print_campaign(&engine.complete_campaign(id).await?);
            }
            CampaignCommand::Cancel { id } => {
                print_campaign(&engine.cancel_campaign(id).await?);
            }
            CampaignCommand::Show { id } => {
                let campaign = engine.campaign(id).await?;
                print_campaign(&campaign);
                println!("{}", serde_json::to_string_pretty(&campaign.rules)?);
            }
            CampaignCommand::List { status } => {
                for campaign in engine.list_campaigns(status.map(Into::into)).await? {
                    print_campaign(&campaign);
                }
            }
        },
        Command::Account(AccountArgs { command }) => match command {
            AccountCommand::Balance(target) => {
                let account = target.account_ref();
                let balance = engine.get_balance(&account).await?;
                println!("{account}: {balance} cents");
            }
            AccountCommand::Reconcile(target) => {
                let report = engine.reconcile_account(&target.account_ref()).await?;
                println!(
                    "{}: stored {} derived {} ({})",
                    report.account_id,
                    report.stored,
                    report.derived,
                    if report.is_consistent() { "ok" } else { "DRIFT" }
                );
                if !report.is_consistent() {
                    std::process::exit(1);
                }
            }
            AccountCommand::History { target, limit } => {
                let account = target.account_ref();
                for tx in engine
                    .list_account_transactions(&account, limit)
                    .await?
                {
                    println!(
                        "{} {} {:+} {}",
                        tx.created_at.to_rfc3339(),
                        tx.kind.as_str(),
                        tx.delta_for(&account.id()),
                        tx.id
                    );
                }
            }
        },
        Command::Clawback { grant_id, reason } => {
            let grant = engine.clawback(grant_id, &reason).await?;
            println!(
                "grant {} is {} ({} cents)",
                grant.id,
                grant.status.as_str(),
                grant.amount_cents
            );
        }
        Command::Sweep => {
            let now = Utc::now();
            let ended = engine.sweep_stale_sessions(now).await?;
            let completed = engine.expire_campaigns(now).await?;
            println!(
                "ended {} stale sessions, completed {} campaigns",
                ended.len(),
                completed.len()
            );
        }
    }

    Ok(())
}
