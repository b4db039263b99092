//! Command implementations behind the binary's subcommands.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::AppConfig;
use crate::db;
use crate::jobs::{self, JobContext, JobOptions, JobReport};
use crate::models::Sport;
use crate::scheduler::Scheduler;

pub async fn build_context(config: AppConfig) -> Result<JobContext> {
    let pool = db::create_pool(&config.database_path).await?;
    db::init_database(&pool).await?;
    Ok(JobContext {
        pool,
        config: Arc::new(config),
        cancel: CancellationToken::new(),
    })
}

/// Wire SIGINT/SIGTERM to the cancellation token. In-flight jobs observe the
/// token at their next suspension point.
pub fn install_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("sigterm handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received");
        cancel.cancel();
    });
}

/// Rows left `running` by a previous process can never finish; close them out
/// so their keys become retryable.
async fn recover_stale_runs(pool: &SqlitePool) -> Result<()> {
    let recovered = db::fail_stale_running_jobs(pool, "interrupted by shutdown").await?;
    if recovered > 0 {
        tracing::warn!(recovered, "closed stale running job rows from a previous process");
    }
    Ok(())
}

/// Combined deployment: read API in the foreground, scheduler in a background
/// task, one shutdown signal for both.
pub async fn serve(config: AppConfig) -> Result<()> {
    let ctx = build_context(config).await?;
    install_signal_handler(ctx.cancel.clone());
    recover_stale_runs(&ctx.pool).await?;

    let scheduler_ctx = ctx.clone();
    let scheduler_task = tokio::spawn(async move {
        Scheduler::new(scheduler_ctx).run().await;
    });

    let state = ApiState {
        pool: ctx.pool.clone(),
        config: ctx.config.clone(),
    };
    api::serve(state, ctx.cancel.clone()).await?;

    scheduler_task.await?;
    Ok(())
}

/// Headless scheduler loop.
pub async fn run_scheduler(config: AppConfig) -> Result<()> {
    let ctx = build_context(config).await?;
    install_signal_handler(ctx.cancel.clone());
    recover_stale_runs(&ctx.pool).await?;
    Scheduler::new(ctx).run().await;
    Ok(())
}

pub async fn pull_odds(config: AppConfig, dry_run: bool) -> Result<()> {
    let ctx = build_context(config).await?;
    install_signal_handler(ctx.cancel.clone());
    let opts = JobOptions {
        job_key: None,
        dry_run,
    };
    let report = jobs::pull_odds::run(&ctx, &opts).await?;
    print_report(jobs::pull_odds::JOB_NAME, &report);
    Ok(())
}

pub async fn run_model(config: AppConfig, sport: &str, dry_run: bool) -> Result<()> {
    let Some(sport) = Sport::from_str_loose(sport) else {
        println!(
            "Unknown sport '{}'. Expected one of: {}",
            sport,
            Sport::ALL
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        return Ok(());
    };
    let ctx = build_context(config).await?;
    install_signal_handler(ctx.cancel.clone());
    let opts = JobOptions {
        job_key: None,
        dry_run,
    };
    let report = jobs::run_model::run(&ctx, sport, &opts).await?;
    print_report(&crate::drivers::model_name(sport), &report);
    Ok(())
}

pub async fn settle(config: AppConfig, dry_run: bool) -> Result<()> {
    let ctx = build_context(config).await?;
    install_signal_handler(ctx.cancel.clone());
    let opts = JobOptions {
        job_key: None,
        dry_run,
    };
    let report = jobs::settle::run(&ctx, &opts).await?;
    print_report(jobs::settle::JOB_NAME, &report);
    Ok(())
}

pub async fn init_db(config: AppConfig) -> Result<()> {
    let ctx = build_context(config).await?;
    let games = db::count_rows(&ctx.pool, "games").await?;
    let cards = db::count_rows(&ctx.pool, "card_payloads").await?;
    println!("Database ready at {}", ctx.config.database_path);
    println!("  games: {}, cards: {}", games, cards);
    Ok(())
}

/// Print the due-window computation for an instant without dispatching
/// anything. The inspection path for the scheduler core.
pub async fn show_tick(config: AppConfig, at: Option<&str>) -> Result<()> {
    let now = match at {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| anyhow::anyhow!("invalid --at instant '{}': {}", raw, e))?,
        None => Utc::now(),
    };

    let ctx = build_context(config).await?;
    let scheduler = Scheduler::new(ctx);
    let candidates = scheduler.due_candidates(now).await?;
    let eligible = scheduler.gate_candidates(candidates.clone()).await?;

    println!("Tick at {} ({} candidates):", now.to_rfc3339(), candidates.len());
    for candidate in &candidates {
        let gated = if eligible.iter().any(|e| e.key == candidate.key) {
            "due"
        } else {
            "satisfied"
        };
        println!("  [{}] {}", gated, candidate.key);
    }
    if candidates.is_empty() {
        println!("  (nothing due)");
    }
    Ok(())
}

fn print_report(job_name: &str, report: &JobReport) {
    if report.skipped {
        println!("{}: skipped (window already satisfied)", job_name);
        return;
    }
    if report.dry_run {
        println!("{}: dry run, nothing written", job_name);
        return;
    }
    println!(
        "{}: {}",
        job_name,
        if report.success { "success" } else { "failed" }
    );
    for (key, value) in &report.counts {
        println!("  {}: {}", key, value);
    }
}
