//! battlecore - operator CLI for the battle ledger
//!
//! Usage:
//!   battlecore serve                      run the scheduler until Ctrl-C
//!   battlecore matchmake                  one matchmaking pass
//!   battlecore verify <match_id>          re-derive a winner from its seed
//!   battlecore payout <match_id>          pay one match (idempotent)
//!   battlecore batch-payout [--apply]     work the unpaid backlog (dry run by default)
//!
//! Every command prints a JSON `{ok, kind, message, data}` outcome.
//!
//! Environment Variables:
//!   BATTLE_CONFIG_PATH - TOML config file (flag --config wins)
//!   BATTLE_DB_PATH     - SQLite ledger (default: battlecore_ledger.db; relative
//!                        db_path in a config file resolves next to that file)
//!   BATTLE_*           - see CoreConfig

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use battlecore_backend::{
    batch::BatchOptions, book::NewBattle, BattleService, CoreConfig, CoreResult, OpOutcome,
};

#[derive(Parser, Debug)]
#[command(name = "battlecore")]
#[command(about = "Matchmaking, fairness audit and payouts for skill battles")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "BATTLE_CONFIG_PATH")]
    config: Option<String>,

    /// SQLite ledger path (overrides config)
    #[arg(long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the battle scheduler until Ctrl-C
    Serve,
    /// Run one matchmaking pass over open battles
    Matchmake,
    /// Recompute a match's winner from its stored seed
    Verify { match_id: String },
    /// Pay out one match
    Payout { match_id: String },
    /// Pay out unpaid matches, newest first
    BatchPayout {
        /// Write payouts; without this flag nothing is changed
        #[arg(long)]
        apply: bool,
        /// Max matches to consider (0 = all)
        #[arg(long, default_value_t = 0)]
        limit: usize,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        concurrency: Option<usize>,
    },
    CreateUser { username: String },
    CreateBattle {
        #[arg(long)]
        creator: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        sport: String,
        #[arg(long)]
        fee: f64,
        /// RFC 3339 start time
        #[arg(long, value_parser = parse_start_at)]
        start_at: Option<DateTime<Utc>>,
    },
    Join { battle_id: String, user_id: String },
    ConfirmPayment { entry_id: String },
    LockEntries { battle_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // a missing .env is fine
    let _ = dotenv();
    init_tracing();

    let args = Args::parse();
    let config = load_config(&args)?;
    let service = BattleService::open(config).context("opening battle ledger")?;

    let ok = match args.command {
        Command::Serve => return serve(service).await,
        Command::Matchmake => emit(service.run_matchmaking().await)?,
        Command::Verify { match_id } => emit(service.verify_match(&match_id).await)?,
        Command::Payout { match_id } => emit(service.pay_match(&match_id).await)?,
        Command::BatchPayout {
            apply,
            limit,
            batch_size,
            concurrency,
        } => {
            let defaults = service.config().batch_options();
            let opts = BatchOptions {
                apply,
                limit,
                batch_size: batch_size.unwrap_or(defaults.batch_size),
                concurrency: concurrency.unwrap_or(defaults.concurrency),
            };
            emit(service.run_batch_payout(opts).await)?
        }
        Command::CreateUser { username } => emit(service.create_user(&username).await)?,
        Command::CreateBattle {
            creator,
            title,
            sport,
            fee,
            start_at,
        } => emit(
            service
                .create_battle(NewBattle {
                    creator_id: creator,
                    title,
                    sport,
                    entry_fee_usd: fee,
                    start_at,
                })
                .await,
        )?,
        Command::Join { battle_id, user_id } => {
            emit(service.join_battle(&battle_id, &user_id).await)?
        }
        Command::ConfirmPayment { entry_id } => {
            emit(service.confirm_entry_payment(&entry_id).await)?
        }
        Command::LockEntries { battle_id } => {
            emit(service.lock_battle_entries(&battle_id).await)?
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

async fn serve(service: BattleService) -> Result<()> {
    if !service.config().scheduler_enabled {
        warn!("BATTLE_SCHEDULER_ENABLED is off, nothing to serve");
        return Ok(());
    }

    let scheduler = service.scheduler();
    info!("🚀 battlecore serving");
    scheduler
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {}", e);
            }
        })
        .await;
    info!("👋 battlecore stopped");
    Ok(())
}

/// Print the structured outcome; returns whether the operation succeeded
fn emit<T: Serialize>(result: CoreResult<T>) -> Result<bool> {
    let outcome = OpOutcome::from(result);
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(outcome.ok)
}

fn load_config(args: &Args) -> Result<CoreConfig> {
    let mut config = match &args.config {
        Some(path) => CoreConfig::load(path)?.with_overrides(|key| std::env::var(key).ok()),
        None => CoreConfig::from_env()?,
    };
    if let Some(db) = &args.db {
        config.db_path = db.clone();
    }
    config.validate()?;
    Ok(config)
}

fn parse_start_at(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("expected RFC 3339 time: {}", e))
}

fn init_tracing() {
    // stdout carries JSON outcomes, logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "battlecore_backend=debug,battlecore=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
