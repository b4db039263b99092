//! Per-sport model run: enrich, drive, write cards. Per-game failures are
//! counted, never fatal; fan-out is bounded by a semaphore.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cards;
use crate::db;
use crate::drivers::{self, DriverDescriptor, DriverGameContext};
use crate::models::{Game, Sport};
use crate::services::team_metrics::TeamMetricsClient;

use super::{run_job, JobContext, JobOptions, JobReport};

/// Bound on concurrent per-game processing inside one job.
const GAME_CONCURRENCY: usize = 4;

pub async fn run(ctx: &JobContext, sport: Sport, opts: &JobOptions) -> Result<JobReport> {
    let metrics = Arc::new(TeamMetricsClient::new());
    run_with_metrics(ctx, sport, opts, metrics).await
}

pub async fn run_with_metrics(
    ctx: &JobContext,
    sport: Sport,
    opts: &JobOptions,
    metrics: Arc<TeamMetricsClient>,
) -> Result<JobReport> {
    let job_name = drivers::model_name(sport);
    let window_key = opts.job_key.clone();

    run_job(ctx, &job_name, opts, |ctx, job_run_id| async move {
        let now = Utc::now();
        let games = db::games_in_window(
            &ctx.pool,
            now - Duration::hours(1),
            now + Duration::hours(ctx.config.horizon_hours),
            Some(&[sport]),
        )
        .await?;

        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        counts.insert("games".to_string(), games.len() as i64);
        counts.insert("cards".to_string(), 0);
        if games.is_empty() {
            return Ok(counts);
        }

        let semaphore = Arc::new(Semaphore::new(GAME_CONCURRENCY));
        let mut set = JoinSet::new();

        for game in games {
            let permit_source = semaphore.clone();
            let ctx = ctx.clone();
            let metrics = metrics.clone();
            let job_run_id = job_run_id.clone();
            let window_key = window_key.clone();
            set.spawn(async move {
                let _permit = permit_source.acquire_owned().await;
                let game_id = game.id.clone();
                let written =
                    process_game(&ctx, sport, &game, &metrics, &job_run_id, window_key.as_deref())
                        .await;
                (game_id, written)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (game_id, written) = joined?;
            match written {
                Ok(n) => *counts.entry("cards".to_string()).or_default() += n,
                Err(e) => {
                    tracing::warn!(job_run_id, sport = %sport, game_id, error = %e, "per-game processing failed");
                    *counts.entry("game_errors".to_string()).or_default() += 1;
                }
            }
        }

        Ok(counts)
    })
    .await
}

/// One game: latest odds, both enrichments, drivers, card writes.
async fn process_game(
    ctx: &JobContext,
    sport: Sport,
    game: &Game,
    metrics: &TeamMetricsClient,
    job_run_id: &str,
    window_key: Option<&str>,
) -> Result<i64> {
    let Some(snapshot) = db::latest_snapshot_for_game(&ctx.pool, &game.id).await? else {
        tracing::debug!(job_run_id, game_id = game.id, "no odds snapshot yet, skipping");
        return Ok(0);
    };

    let home = metrics.metrics_for_team(&game.home_team, sport).await;
    let away = metrics.metrics_for_team(&game.away_team, sport).await;

    let driver_ctx = DriverGameContext {
        game,
        snapshot: &snapshot,
        home: &home,
        away: &away,
    };
    let descriptors = dedupe_descriptors(drivers::compute_drivers(sport, &driver_ctx));

    let now = Utc::now();
    let mut written = 0i64;
    for descriptor in &descriptors {
        let Some(built) = cards::build_card(
            descriptor,
            game,
            &snapshot,
            sport,
            ctx.config.timezone,
            now,
        )?
        else {
            continue;
        };
        let outcome = cards::write_card(
            &ctx.pool,
            &built,
            descriptor,
            game,
            sport,
            &snapshot,
            Some(job_run_id),
            window_key,
            now,
        )
        .await?;
        if matches!(outcome, db::cards::CardWriteOutcome::Written { .. }) {
            written += 1;
        }
    }
    Ok(written)
}

/// Keep one descriptor per card type, highest confidence winning ties in
/// arrival order.
fn dedupe_descriptors(descriptors: Vec<DriverDescriptor>) -> Vec<DriverDescriptor> {
    let mut best: HashMap<String, DriverDescriptor> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for descriptor in descriptors {
        match best.get(&descriptor.card_type) {
            Some(existing) if existing.confidence >= descriptor.confidence => {}
            Some(_) => {
                best.insert(descriptor.card_type.clone(), descriptor);
            }
            None => {
                order.push(descriptor.card_type.clone());
                best.insert(descriptor.card_type.clone(), descriptor);
            }
        }
    }
    order.into_iter().filter_map(|t| best.remove(&t)).collect()
}
