mod api;
mod cards;
mod cli;
mod config;
mod db;
mod drivers;
mod errors;
mod jobs;
mod models;
mod scheduler;
mod services;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "cardforge")]
#[command(about = "Sports-betting analytics pipeline: odds, driver cards, settlement")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the read API with the scheduler in the background
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run the scheduler loop without the API
    Scheduler,
    /// Pull bookmaker odds once for every enabled sport
    PullOdds {
        #[arg(long)]
        dry_run: bool,
    },
    /// Run one sport's driver models over upcoming games
    RunModel {
        #[arg(short, long)]
        sport: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Grade finished games and settle pending cards
    Settle {
        #[arg(long)]
        dry_run: bool,
    },
    /// Initialize the database schema
    InitDb,
    /// Show the due-window computation for an instant without dispatching
    Tick {
        #[arg(long)]
        at: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env();

    match cli.command {
        Some(Commands::Serve { port }) => {
            if let Some(port) = port {
                config.server_port = port;
            }
            tracing::info!(port = config.server_port, "starting combined serve mode");
            cli::serve(config).await?;
        }
        Some(Commands::Scheduler) => {
            cli::run_scheduler(config).await?;
        }
        Some(Commands::PullOdds { dry_run }) => {
            cli::pull_odds(config, dry_run).await?;
        }
        Some(Commands::RunModel { sport, dry_run }) => {
            cli::run_model(config, &sport, dry_run).await?;
        }
        Some(Commands::Settle { dry_run }) => {
            cli::settle(config, dry_run).await?;
        }
        Some(Commands::InitDb) => {
            cli::init_db(config).await?;
        }
        Some(Commands::Tick { at }) => {
            cli::show_tick(config, at.as_deref()).await?;
        }
        None => {
            tracing::info!(port = config.server_port, "starting combined serve mode");
            cli::serve(config).await?;
        }
    }

    Ok(())
}
