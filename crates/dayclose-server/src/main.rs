//! `dayclose` — host process and operator CLI.
//!
//! `serve` runs the engine loop with the daily trigger armed; the other
//! commands work against the same SQLite database and exit.

use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dayclose_closing::{status, workflow, ClosingInput};
use dayclose_core::{ClosingDate, DaycloseConfig, UserId};
use dayclose_scheduler::{next_fire, start_schedule, SchedulerOptions};
use tracing::{info, warn};

mod app;

use app::App;

#[derive(Parser)]
#[command(name = "dayclose")]
#[command(about = "Durable daily closing scheduler")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("DAYCLOSE_GIT_SHA"), ")"))]
struct Cli {
    /// Path to dayclose.toml (default: $DAYCLOSE_CONFIG, then ~/.dayclose/dayclose.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine and the daily trigger until Ctrl-C
    Serve,

    /// Enqueue a closing run for one date; a running `serve` picks it up
    Run {
        /// Closing date, YYYY-MM-DD
        #[arg(long)]
        date: String,

        #[arg(long)]
        skip_oracle_closing: bool,

        #[arg(long)]
        skip_financial_metrics: bool,

        /// Operator to submit the job as (default: closing.default_user_id)
        #[arg(long)]
        user_id: Option<String>,
    },

    /// Print the status of the closing instance for a date as JSON
    Status {
        /// Closing date, YYYY-MM-DD
        #[arg(long)]
        date: String,
    },

    /// Print when the daily trigger fires next
    NextFire,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "dayclose=info,dayclose_engine=info,dayclose_closing=info,dayclose_scheduler=info"
                    .into()
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = DaycloseConfig::resolve_path(cli.config.as_deref());
    if !std::path::Path::new(&config_path).exists() {
        warn!(path = %config_path, "config file not found, using defaults");
    }
    let config = DaycloseConfig::load(Some(&config_path)).context("loading configuration")?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Run {
            date,
            skip_oracle_closing,
            skip_financial_metrics,
            user_id,
        } => {
            let input = ClosingInput {
                date: Some(date),
                skip_oracle_closing,
                skip_financial_metrics,
                user_id,
            };
            enqueue(config, input)
        }
        Commands::Status { date } => print_status(config, &date).await,
        Commands::NextFire => print_next_fire(&config),
    }
}

async fn serve(config: DaycloseConfig) -> anyhow::Result<()> {
    let app = App::open(&config)?;
    let recovered = app.runtime.recover()?;
    info!(recovered, "database ready");

    start_schedule(&app.runtime)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let runtime = app.runtime.clone();
    let engine = tokio::spawn(async move { runtime.run(shutdown_rx).await });
    info!("dayclose serving; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    engine.await?;
    Ok(())
}

fn enqueue(config: DaycloseConfig, input: ClosingInput) -> anyhow::Result<()> {
    // Reject bad arguments here rather than as a failed run.
    let date = ClosingDate::parse(input.date.as_deref().unwrap_or_default())?;
    if let Some(user) = input.user_id.as_deref() {
        UserId::parse(user)?;
    }

    let app = App::open(&config)?;
    let target = workflow::target(&date);
    let message_id = app
        .runtime
        .send(target.clone(), serde_json::to_value(&input)?, Duration::ZERO)?;
    info!(%target, %message_id, "closing run enqueued");
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "workflow_id": date.format(),
            "message_id": message_id,
        }))?
    );
    Ok(())
}

async fn print_status(config: DaycloseConfig, date: &str) -> anyhow::Result<()> {
    let date = ClosingDate::parse(date)?;
    let app = App::open(&config)?;
    let status = status::status(&app.runtime, app.backend.as_ref(), &date).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn print_next_fire(config: &DaycloseConfig) -> anyhow::Result<()> {
    let options = SchedulerOptions::from_config(config)?;
    let now = Utc::now();
    let next = next_fire(now, options.hour, options.minute, options.zone)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "next_fire_at": next.target,
            "local": options.zone.format_local(next.target),
            "delay_secs": next.delay.as_secs(),
        }))?
    );
    Ok(())
}
