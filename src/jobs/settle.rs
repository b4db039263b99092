//! Settlement job: game grading then card grading under one job run.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::Utc;

use crate::services::settlement::{grade_cards, grade_games, ScoreboardClient};

use super::{run_job, JobContext, JobOptions, JobReport};

pub const JOB_NAME: &str = "settle_results";

pub async fn run(ctx: &JobContext, opts: &JobOptions) -> Result<JobReport> {
    let client = ScoreboardClient::new();
    run_with_client(ctx, opts, client).await
}

pub async fn run_with_client(
    ctx: &JobContext,
    opts: &JobOptions,
    client: ScoreboardClient,
) -> Result<JobReport> {
    run_job(ctx, JOB_NAME, opts, |ctx, job_run_id| async move {
        let now = Utc::now();

        let games = grade_games(&ctx.pool, &ctx.config, &client, now).await?;
        tracing::info!(
            job_run_id,
            graded = games.graded,
            voided = games.voided_cards,
            unresolved = games.unresolved,
            "game grading complete"
        );

        let cards = grade_cards(&ctx.pool, now).await?;
        tracing::info!(
            job_run_id,
            settled = cards.settled,
            errors = cards.errors,
            "card grading complete"
        );

        let mut counts = BTreeMap::new();
        counts.insert("games_graded".to_string(), games.graded);
        counts.insert("cards_voided".to_string(), games.voided_cards);
        counts.insert("games_unresolved".to_string(), games.unresolved);
        counts.insert("cards_settled".to_string(), cards.settled);
        counts.insert("card_errors".to_string(), cards.errors);
        Ok(counts)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::{self, test_pool};
    use crate::db::cards::{prepare_model_and_card_write, CardWriteOutcome, NewCard};
    use crate::models::{BetType, Game, Sport};
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn test_ctx() -> JobContext {
        JobContext {
            pool: test_pool().await,
            config: Arc::new(AppConfig::for_tests()),
            cancel: CancellationToken::new(),
        }
    }

    async fn seed_settleable_card(ctx: &JobContext) -> String {
        let start = Utc::now() - Duration::hours(6);
        let game = Game {
            id: Game::make_id(Sport::Nhl, "401559600"),
            sport: "nhl".to_string(),
            provider_game_id: "401559600".to_string(),
            home_team: "Boston Bruins".to_string(),
            away_team: "Toronto Maple Leafs".to_string(),
            game_time_utc: start,
            status: "scheduled".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        db::upsert_game(&ctx.pool, &game).await.unwrap();

        let new_card = NewCard {
            game_id: game.id.clone(),
            sport: "nhl".to_string(),
            card_type: "nhl-goalie".to_string(),
            card_title: "Goalie Edge".to_string(),
            payload_data: json!({
                "schema_version": 1,
                "recommendation": {"type": "ML_HOME", "text": "Boston Bruins ML (-150)"},
                "prediction": "HOME",
                "odds_context": {"h2h_home": -150.0, "h2h_away": 130.0,
                                  "captured_at": Utc.with_ymd_and_hms(2026, 2, 27, 18, 0, 0).unwrap().to_rfc3339()},
            }),
            created_at: Utc::now() - Duration::hours(7),
            expires_at: None,
            recommended_bet_type: BetType::Moneyline,
            model_name: "run_nhl_model".to_string(),
            model_version: "nhl_v1".to_string(),
            prediction_type: "HOME".to_string(),
            confidence: 0.72,
            output: json!({}),
            odds_snapshot_id: None,
            job_run_id: None,
            window_key: Some("nhl|tminus|401559600|120".to_string()),
            metadata: Some(json!({"confidence": 0.72})),
        };
        let CardWriteOutcome::Written { .. } =
            prepare_model_and_card_write(&ctx.pool, &new_card).await.unwrap()
        else {
            panic!("card not written");
        };
        game.id
    }

    #[tokio::test]
    async fn settles_pending_cards_against_final_scores() {
        let ctx = test_ctx().await;
        let game_id = seed_settleable_card(&ctx).await;

        // game already graded: phase 2 settles the card without any fetch
        db::upsert_game_result(&ctx.pool, &game_id, 4, 2, "final", Utc::now())
            .await
            .unwrap();

        // scoreboard source unreachable: phase 1 leaves nothing to do
        let client = ScoreboardClient::with_base_url("http://127.0.0.1:9");
        let opts = JobOptions {
            job_key: Some("settle|2026-02-27|00".to_string()),
            dry_run: false,
        };
        let report = run_with_client(&ctx, &opts, client).await.unwrap();

        assert!(report.success);
        assert_eq!(report.counts.get("cards_settled"), Some(&1));

        let pending = db::cards::pending_results_for_game(&ctx.pool, &game_id)
            .await
            .unwrap();
        assert!(pending.is_empty());

        let stats = db::cards::get_tracking_stats(&ctx.pool, "nhl")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.wins, 1);
        assert!((stats.units - 0.6667).abs() < 0.005);
    }

    #[tokio::test]
    async fn second_run_settles_nothing_new() {
        let ctx = test_ctx().await;
        let game_id = seed_settleable_card(&ctx).await;
        db::upsert_game_result(&ctx.pool, &game_id, 4, 2, "final", Utc::now())
            .await
            .unwrap();

        for key in ["settle|a", "settle|b"] {
            let client = ScoreboardClient::with_base_url("http://127.0.0.1:9");
            let opts = JobOptions {
                job_key: Some(key.to_string()),
                dry_run: false,
            };
            run_with_client(&ctx, &opts, client).await.unwrap();
        }

        let stats = db::cards::get_tracking_stats(&ctx.pool, "nhl")
            .await
            .unwrap()
            .unwrap();
        // exactly one settlement despite two runs
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 0);
    }
}
