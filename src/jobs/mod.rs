//! Job execution contract shared by every runner.
//!
//! A job is: gate on the idempotency key, honor dry-run, record a running
//! job_runs row, execute the body, and close the row out terminally. The body
//! is raced against the process cancellation token so shutdown lands at the
//! next suspension point.

pub mod pull_odds;
pub mod run_model;
pub mod settle;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::db;
use crate::errors::PipelineError;
use crate::models::JobStatus;

#[derive(Clone)]
pub struct JobContext {
    pub pool: SqlitePool,
    pub config: Arc<AppConfig>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub job_key: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct JobReport {
    pub success: bool,
    pub job_run_id: Option<String>,
    pub skipped: bool,
    pub dry_run: bool,
    pub counts: BTreeMap<String, i64>,
}

impl JobReport {
    fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            ..Default::default()
        }
    }

    fn dry() -> Self {
        Self {
            success: true,
            dry_run: true,
            ..Default::default()
        }
    }
}

/// Wrap a job body with the uniform contract. The body receives the job run
/// id for provenance and returns its counters.
pub async fn run_job<F, Fut>(
    ctx: &JobContext,
    job_name: &str,
    opts: &JobOptions,
    body: F,
) -> Result<JobReport>
where
    F: FnOnce(JobContext, String) -> Fut,
    Fut: Future<Output = Result<BTreeMap<String, i64>>>,
{
    if let Some(job_key) = &opts.job_key {
        if !db::should_run_job_key(&ctx.pool, job_key).await? {
            tracing::info!(job_name, job_key, "job key already satisfied, skipping");
            return Ok(JobReport::skipped());
        }
    }
    if opts.dry_run {
        tracing::info!(job_name, job_key = ?opts.job_key, "dry run, not executing");
        return Ok(JobReport::dry());
    }

    let job_run_id =
        db::insert_job_run(&ctx.pool, job_name, opts.job_key.as_deref(), Utc::now()).await?;
    tracing::info!(job_name, job_key = ?opts.job_key, job_run_id, "job started");

    let outcome = tokio::select! {
        _ = ctx.cancel.cancelled() => Err(PipelineError::Cancelled.into()),
        result = body(ctx.clone(), job_run_id.clone()) => result,
    };

    match outcome {
        Ok(counts) => {
            db::finish_job_run(&ctx.pool, &job_run_id, JobStatus::Success, None).await?;
            tracing::info!(job_name, job_run_id, ?counts, "job succeeded");
            Ok(JobReport {
                success: true,
                job_run_id: Some(job_run_id),
                counts,
                ..Default::default()
            })
        }
        Err(e) => {
            let message = if e.downcast_ref::<PipelineError>().map(|p| matches!(p, PipelineError::Cancelled)).unwrap_or(false) {
                "cancelled".to_string()
            } else {
                e.to_string()
            };
            db::finish_job_run(&ctx.pool, &job_run_id, JobStatus::Failed, Some(&message)).await?;
            tracing::error!(job_name, job_run_id, error = %message, "job failed");
            Err(e)
        }
    }
}
