//! Hourly odds pull: one aggregator fetch per enabled sport, one transaction
//! per sport batch.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{Duration, Utc};

use crate::db;
use crate::errors::PipelineError;
use crate::models::{Game, GameStatus, OddsSnapshot, Sport};
use crate::services::odds_fetcher::{CanonicalGame, OddsFetcher};

use super::{run_job, JobContext, JobOptions, JobReport};

pub const JOB_NAME: &str = "pull_odds_hourly";

/// Snapshots older than this are pruned after a successful pull.
const SNAPSHOT_RETENTION_HOURS: i64 = 2;

pub async fn run(ctx: &JobContext, opts: &JobOptions) -> Result<JobReport> {
    run_job(ctx, JOB_NAME, opts, |ctx, job_run_id| async move {
        let fetcher = OddsFetcher::new(&ctx.config.odds_api_key);
        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        let mut attempted = 0usize;
        let mut failed_sports = 0usize;

        for sport in Sport::ALL {
            if !ctx.config.sport_enabled(sport) {
                continue;
            }
            attempted += 1;

            let outcome = match fetcher.fetch_sport(sport, ctx.config.horizon_hours).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(job_run_id, sport = %sport, error = %e, "odds fetch failed");
                    failed_sports += 1;
                    *counts.entry(format!("{}_failed", sport)).or_default() += 1;
                    continue;
                }
            };

            for error in &outcome.errors {
                tracing::warn!(job_run_id, sport = %sport, "{}", error);
            }
            *counts.entry("skipped_missing_fields".to_string()).or_default() +=
                outcome.skipped_missing_fields as i64;

            let stored = store_batch(&ctx, &outcome.games, &job_run_id).await?;
            tracing::info!(
                job_run_id,
                sport = %sport,
                raw = outcome.raw_count,
                stored,
                "odds batch persisted"
            );
            *counts.entry(format!("{}_fetched", sport)).or_default() += stored as i64;
            *counts.entry("snapshots".to_string()).or_default() += stored as i64;
        }

        if attempted > 0 && failed_sports == attempted {
            return Err(
                PipelineError::ExternalUnavailable("all sport fetches failed".to_string()).into(),
            );
        }

        let pruned = db::prune_snapshots_before(
            &ctx.pool,
            Utc::now() - Duration::hours(SNAPSHOT_RETENTION_HOURS),
        )
        .await?;
        if pruned > 0 {
            counts.insert("snapshots_pruned".to_string(), pruned as i64);
        }

        Ok(counts)
    })
    .await
}

/// Upsert each game and append each snapshot within a single transaction, all
/// rows carrying the job-run provenance.
async fn store_batch(
    ctx: &JobContext,
    games: &[CanonicalGame],
    job_run_id: &str,
) -> Result<u64> {
    if games.is_empty() {
        return Ok(0);
    }
    let mut tx = ctx.pool.begin().await?;
    let now = Utc::now();
    let mut stored = 0u64;

    for canonical in games {
        let game = Game {
            id: Game::make_id(canonical.sport, &canonical.provider_game_id),
            sport: canonical.sport.as_str().to_string(),
            provider_game_id: canonical.provider_game_id.clone(),
            home_team: canonical.home_team.clone(),
            away_team: canonical.away_team.clone(),
            game_time_utc: canonical.game_time_utc,
            status: GameStatus::Scheduled.as_str().to_string(),
            created_at: now,
            updated_at: now,
        };
        db::upsert_game(&mut *tx, &game).await?;

        let snapshot = OddsSnapshot {
            id: uuid::Uuid::new_v4().to_string(),
            game_id: game.id.clone(),
            captured_at: canonical.captured_at_utc,
            moneyline_home: canonical.moneyline_home,
            moneyline_away: canonical.moneyline_away,
            total_line: canonical.total_line,
            spread_home: canonical.spread_home,
            spread_away: canonical.spread_away,
            raw: Some(canonical.raw.to_string()),
            job_run_id: Some(job_run_id.to_string()),
        };
        db::insert_odds_snapshot(&mut *tx, &snapshot).await?;
        stored += 1;
    }

    tx.commit().await?;
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::test_pool;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn canonical(provider_id: &str) -> CanonicalGame {
        CanonicalGame {
            provider_game_id: provider_id.to_string(),
            sport: Sport::Nhl,
            home_team: "Boston Bruins".to_string(),
            away_team: "Toronto Maple Leafs".to_string(),
            game_time_utc: Utc.with_ymd_and_hms(2026, 2, 27, 20, 0, 0).unwrap(),
            captured_at_utc: Utc::now(),
            moneyline_home: Some(-150.0),
            moneyline_away: Some(130.0),
            total_line: Some(6.5),
            spread_home: Some(-1.5),
            spread_away: Some(1.5),
            raw: serde_json::json!({"id": provider_id}),
        }
    }

    #[tokio::test]
    async fn batch_upserts_games_and_appends_snapshots() {
        let ctx = JobContext {
            pool: test_pool().await,
            config: Arc::new(AppConfig::for_tests()),
            cancel: CancellationToken::new(),
        };
        let run_id = db::insert_job_run(&ctx.pool, JOB_NAME, None, Utc::now())
            .await
            .unwrap();

        let batch = vec![canonical("evt1"), canonical("evt2")];
        let stored = store_batch(&ctx, &batch, &run_id).await.unwrap();
        assert_eq!(stored, 2);

        // second ingest of the identical payload: same game rows, more snapshots
        let stored = store_batch(&ctx, &batch, &run_id).await.unwrap();
        assert_eq!(stored, 2);

        assert_eq!(db::count_rows(&ctx.pool, "games").await.unwrap(), 2);
        assert_eq!(db::count_rows(&ctx.pool, "odds_snapshots").await.unwrap(), 4);

        let game = db::get_game(&ctx.pool, "game-nhl-evt1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(game.provider_game_id, "evt1");

        let snap = db::latest_snapshot_for_game(&ctx.pool, &game.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snap.job_run_id.as_deref(), Some(run_id.as_str()));
    }
}
