use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::errors::PipelineError;
use crate::models::{
    BetType, CardPayload, CardResult, GameResult, SettleOutcome,
};

/// Everything needed to persist one card atomically: the model output row,
/// the payload, and the pending ledger row.
#[derive(Debug, Clone)]
pub struct NewCard {
    pub game_id: String,
    pub sport: String,
    pub card_type: String,
    pub card_title: String,
    pub payload_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub recommended_bet_type: BetType,
    pub model_name: String,
    pub model_version: String,
    pub prediction_type: String,
    pub confidence: f64,
    pub output: serde_json::Value,
    pub odds_snapshot_id: Option<String>,
    pub job_run_id: Option<String>,
    pub window_key: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardWriteOutcome {
    Written { card_id: String },
    /// A card for this (game, card_type) already exists in the current
    /// scheduling window.
    Skipped,
}

/// Single transaction: gate on the scheduling window, then insert the
/// model_output, the card_payload, and a pending card_result together.
/// Concurrent writers for the same (game, card_type, window) either both
/// no-op or exactly one wins; the partial unique index backs this up.
pub async fn prepare_model_and_card_write(
    pool: &SqlitePool,
    new: &NewCard,
) -> Result<CardWriteOutcome> {
    let mut tx = pool.begin().await?;

    if let Some(window_key) = &new.window_key {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM card_payloads WHERE game_id = ? AND card_type = ? AND window_key = ?",
        )
        .bind(&new.game_id)
        .bind(&new.card_type)
        .bind(window_key)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            tx.rollback().await?;
            return Ok(CardWriteOutcome::Skipped);
        }
    }

    let model_output_id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO model_outputs
            (id, game_id, model_name, model_version, prediction_type,
             predicted_at, confidence, output, odds_snapshot_id, job_run_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&model_output_id)
    .bind(&new.game_id)
    .bind(&new.model_name)
    .bind(&new.model_version)
    .bind(&new.prediction_type)
    .bind(new.created_at.to_rfc3339())
    .bind(new.confidence)
    .bind(new.output.to_string())
    .bind(&new.odds_snapshot_id)
    .bind(&new.job_run_id)
    .execute(&mut *tx)
    .await?;

    let card_id = uuid::Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        r#"
        INSERT INTO card_payloads
            (id, game_id, sport, card_type, card_title, created_at, expires_at,
             payload_data, model_output_ids, window_key, metadata)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&card_id)
    .bind(&new.game_id)
    .bind(&new.sport)
    .bind(&new.card_type)
    .bind(&new.card_title)
    .bind(new.created_at.to_rfc3339())
    .bind(new.expires_at.map(|t| t.to_rfc3339()))
    .bind(new.payload_data.to_string())
    .bind(serde_json::json!([model_output_id]).to_string())
    .bind(&new.window_key)
    .bind(new.metadata.as_ref().map(|m| m.to_string()))
    .execute(&mut *tx)
    .await;

    if let Err(e) = inserted {
        tx.rollback().await?;
        // a concurrent writer winning the window race is a no-op, not a bug
        if is_unique_violation(&e) {
            return Ok(CardWriteOutcome::Skipped);
        }
        return Err(PipelineError::StoreIntegrity(e.to_string()).into());
    }

    sqlx::query(
        r#"
        INSERT INTO card_results
            (id, card_id, game_id, sport, card_type, recommended_bet_type, status, metadata)
        VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(&card_id)
    .bind(&new.game_id)
    .bind(&new.sport)
    .bind(&new.card_type)
    .bind(new.recommended_bet_type.as_str())
    .bind(new.metadata.as_ref().map(|m| m.to_string()))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(CardWriteOutcome::Written { card_id })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

pub async fn get_model_output(
    pool: &SqlitePool,
    id: &str,
) -> Result<Option<crate::models::ModelOutput>> {
    let row = sqlx::query_as::<_, crate::models::ModelOutput>(
        "SELECT * FROM model_outputs WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn model_outputs_for_card(
    pool: &SqlitePool,
    card: &CardPayload,
) -> Result<Vec<crate::models::ModelOutput>> {
    let ids: Vec<String> = serde_json::from_str(&card.model_output_ids).unwrap_or_default();
    let mut out = Vec::with_capacity(ids.len());
    for id in &ids {
        if let Some(row) = get_model_output(pool, id).await? {
            out.push(row);
        }
    }
    Ok(out)
}

pub async fn get_card(pool: &SqlitePool, card_id: &str) -> Result<Option<CardPayload>> {
    let card = sqlx::query_as::<_, CardPayload>("SELECT * FROM card_payloads WHERE id = ?")
        .bind(card_id)
        .fetch_optional(pool)
        .await?;
    Ok(card)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardDedup {
    /// Keep only the most recent card per (game, card_type).
    LatestPerGameType,
    None,
}

/// Non-expired cards for a game, newest first, optional card_type filter.
pub async fn active_cards_for_game(
    pool: &SqlitePool,
    game_id: &str,
    now: DateTime<Utc>,
    card_type: Option<&str>,
    dedup: CardDedup,
) -> Result<Vec<CardPayload>> {
    let mut cards = sqlx::query_as::<_, CardPayload>(
        r#"
        SELECT * FROM card_payloads
        WHERE game_id = ? AND (expires_at IS NULL OR expires_at > ?)
        ORDER BY created_at DESC
        "#,
    )
    .bind(game_id)
    .bind(now.to_rfc3339())
    .fetch_all(pool)
    .await?;

    if let Some(wanted) = card_type {
        cards.retain(|c| c.card_type == wanted);
    }

    if dedup == CardDedup::LatestPerGameType {
        let mut seen = std::collections::HashSet::new();
        cards.retain(|c| seen.insert(c.card_type.clone()));
    }
    Ok(cards)
}

// ── Settlement-side queries ───────────────────────────────────────────────────

/// Pending ledger rows whose game already has a final result.
pub async fn pending_results_with_finals(
    pool: &SqlitePool,
) -> Result<Vec<(CardResult, GameResult)>> {
    let rows = sqlx::query(
        r#"
        SELECT cr.id AS cr_id, cr.card_id, cr.game_id, cr.sport, cr.card_type,
               cr.recommended_bet_type, cr.status, cr.result, cr.settled_at,
               cr.pnl_units, cr.metadata,
               gr.home_score, gr.away_score, gr.status AS gr_status, gr.final_at
        FROM card_results cr
        JOIN game_results gr ON gr.game_id = cr.game_id
        WHERE cr.status = 'pending' AND gr.status = 'final'
        ORDER BY gr.final_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let card_result = CardResult {
            id: row.get("cr_id"),
            card_id: row.get("card_id"),
            game_id: row.get("game_id"),
            sport: row.get("sport"),
            card_type: row.get("card_type"),
            recommended_bet_type: row.get("recommended_bet_type"),
            status: row.get("status"),
            result: row.get("result"),
            settled_at: parse_opt_ts(row.get::<Option<String>, _>("settled_at"))?,
            pnl_units: row.get("pnl_units"),
            metadata: row.get("metadata"),
        };
        let game_result = GameResult {
            game_id: card_result.game_id.clone(),
            home_score: row.get("home_score"),
            away_score: row.get("away_score"),
            status: row.get("gr_status"),
            final_at: parse_ts(row.get::<String, _>("final_at"))?,
        };
        out.push((card_result, game_result));
    }
    Ok(out)
}

pub async fn pending_results_for_game(
    pool: &SqlitePool,
    game_id: &str,
) -> Result<Vec<CardResult>> {
    let rows = sqlx::query_as::<_, CardResult>(
        "SELECT * FROM card_results WHERE game_id = ? AND status = 'pending'",
    )
    .bind(game_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// pending -> settled, exactly once. Returns false when the row was already
/// settled (or missing), in which case nothing was written.
pub async fn settle_card_result(
    pool: &SqlitePool,
    card_result_id: &str,
    outcome: SettleOutcome,
    pnl_units: f64,
    settled_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE card_results
        SET status = 'settled', result = ?, pnl_units = ?, settled_at = ?
        WHERE id = ? AND status = 'pending'
        "#,
    )
    .bind(outcome.as_str())
    .bind(pnl_units)
    .bind(settled_at.to_rfc3339())
    .bind(card_result_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn get_card_result(pool: &SqlitePool, id: &str) -> Result<Option<CardResult>> {
    let row = sqlx::query_as::<_, CardResult>("SELECT * FROM card_results WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn apply_tracking_delta(
    pool: &SqlitePool,
    sport: &str,
    outcome: SettleOutcome,
    pnl_units: f64,
) -> Result<()> {
    let (w, l, p) = match outcome {
        SettleOutcome::Win => (1i64, 0i64, 0i64),
        SettleOutcome::Loss => (0, 1, 0),
        SettleOutcome::Push => (0, 0, 1),
        SettleOutcome::Void => (0, 0, 0),
    };
    sqlx::query(
        r#"
        INSERT INTO tracking_stats (sport, wins, losses, pushes, units, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(sport) DO UPDATE SET
            wins       = wins + excluded.wins,
            losses     = losses + excluded.losses,
            pushes     = pushes + excluded.pushes,
            units      = units + excluded.units,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(sport)
    .bind(w)
    .bind(l)
    .bind(p)
    .bind(pnl_units)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_tracking_stats(
    pool: &SqlitePool,
    sport: &str,
) -> Result<Option<crate::models::TrackingStats>> {
    let row = sqlx::query_as::<_, crate::models::TrackingStats>(
        "SELECT * FROM tracking_stats WHERE sport = ?",
    )
    .bind(sport)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

// ── Ledger queries for the read API ───────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct LedgerRow {
    pub card_id: String,
    pub game_id: String,
    pub sport: String,
    pub card_type: String,
    pub market: String,
    pub result: Option<String>,
    pub pnl_units: Option<f64>,
    pub settled_at: Option<DateTime<Utc>>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub sport: Option<String>,
    /// "driver" or "call"; derived from the card type suffix.
    pub card_category: Option<String>,
    pub min_confidence: Option<f64>,
    pub market: Option<String>,
}

pub fn card_category(card_type: &str) -> &'static str {
    if card_type.ends_with("-game-call") {
        "call"
    } else {
        "driver"
    }
}

/// Settled ledger rows, newest settlement first. Filtering on the metadata
/// confidence happens here so the API layer stays declarative.
pub async fn settled_ledger(pool: &SqlitePool, filter: &LedgerFilter) -> Result<Vec<LedgerRow>> {
    let rows = sqlx::query_as::<_, CardResult>(
        "SELECT * FROM card_results WHERE status = 'settled' ORDER BY settled_at DESC",
    )
    .fetch_all(pool)
    .await?;

    let mut out = Vec::new();
    for r in rows {
        if let Some(sport) = &filter.sport {
            if &r.sport != sport {
                continue;
            }
        }
        if let Some(category) = &filter.card_category {
            if card_category(&r.card_type) != category {
                continue;
            }
        }
        if let Some(market) = &filter.market {
            if &r.recommended_bet_type != market {
                continue;
            }
        }
        let confidence = r
            .metadata
            .as_deref()
            .and_then(|m| serde_json::from_str::<serde_json::Value>(m).ok())
            .and_then(|v| v.get("confidence").and_then(|c| c.as_f64()));
        if let Some(min) = filter.min_confidence {
            match confidence {
                Some(c) if c >= min => {}
                _ => continue,
            }
        }
        out.push(LedgerRow {
            card_id: r.card_id,
            game_id: r.game_id,
            sport: r.sport,
            card_type: r.card_type,
            market: r.recommended_bet_type,
            result: r.result,
            pnl_units: r.pnl_units,
            settled_at: r.settled_at,
            confidence,
        });
    }
    Ok(out)
}

fn parse_ts(s: String) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(&s)?.with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(parse_ts).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::{Game, Sport};
    use chrono::TimeZone;

    async fn seed_game(pool: &SqlitePool, provider_id: &str) -> String {
        let game = Game {
            id: Game::make_id(Sport::Nhl, provider_id),
            sport: "nhl".to_string(),
            provider_game_id: provider_id.to_string(),
            home_team: "Boston Bruins".to_string(),
            away_team: "Toronto Maple Leafs".to_string(),
            game_time_utc: Utc.with_ymd_and_hms(2026, 2, 27, 20, 0, 0).unwrap(),
            status: "scheduled".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        crate::db::upsert_game(pool, &game).await.unwrap();
        game.id
    }

    fn sample_card(game_id: &str, window_key: Option<&str>) -> NewCard {
        NewCard {
            game_id: game_id.to_string(),
            sport: "nhl".to_string(),
            card_type: "nhl-goalie".to_string(),
            card_title: "Goalie Edge".to_string(),
            payload_data: serde_json::json!({"schema_version": 1}),
            created_at: Utc::now(),
            expires_at: Some(Utc::now() + chrono::Duration::hours(2)),
            recommended_bet_type: BetType::Moneyline,
            model_name: "run_nhl_model".to_string(),
            model_version: "nhl_v1".to_string(),
            prediction_type: "HOME".to_string(),
            confidence: 0.72,
            output: serde_json::json!({"driver_key": "goalie_edge"}),
            odds_snapshot_id: None,
            job_run_id: None,
            window_key: window_key.map(String::from),
            metadata: Some(serde_json::json!({"confidence": 0.72})),
        }
    }

    #[tokio::test]
    async fn card_write_is_idempotent_within_window() {
        let pool = test_pool().await;
        let game_id = seed_game(&pool, "401559100").await;
        let card = sample_card(&game_id, Some("nhl|tminus|401559100|120"));

        let first = prepare_model_and_card_write(&pool, &card).await.unwrap();
        let CardWriteOutcome::Written { card_id } = &first else {
            panic!("expected write");
        };

        // the model output row is created in the same transaction and linked
        let stored = get_card(&pool, card_id).await.unwrap().unwrap();
        let outputs = model_outputs_for_card(&pool, &stored).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].model_version, "nhl_v1");
        assert_eq!(outputs[0].game_id, game_id);

        let second = prepare_model_and_card_write(&pool, &card).await.unwrap();
        assert_eq!(second, CardWriteOutcome::Skipped);

        assert_eq!(
            crate::db::count_rows(&pool, "card_payloads").await.unwrap(),
            1
        );
        assert_eq!(
            crate::db::count_rows(&pool, "card_results").await.unwrap(),
            1
        );
        assert_eq!(
            crate::db::count_rows(&pool, "model_outputs").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn different_window_allows_new_card() {
        let pool = test_pool().await;
        let game_id = seed_game(&pool, "401559101").await;

        let band_120 = sample_card(&game_id, Some("nhl|tminus|401559101|120"));
        let band_30 = sample_card(&game_id, Some("nhl|tminus|401559101|30"));

        assert!(matches!(
            prepare_model_and_card_write(&pool, &band_120).await.unwrap(),
            CardWriteOutcome::Written { .. }
        ));
        assert!(matches!(
            prepare_model_and_card_write(&pool, &band_30).await.unwrap(),
            CardWriteOutcome::Written { .. }
        ));
        assert_eq!(
            crate::db::count_rows(&pool, "card_payloads").await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn settle_is_one_shot() {
        let pool = test_pool().await;
        let game_id = seed_game(&pool, "401559102").await;
        let card = sample_card(&game_id, Some("nhl|tminus|401559102|60"));
        let CardWriteOutcome::Written { card_id } =
            prepare_model_and_card_write(&pool, &card).await.unwrap()
        else {
            panic!("expected write");
        };

        let pending = pending_results_for_game(&pool, &game_id).await.unwrap();
        assert_eq!(pending.len(), 1);
        let result_id = pending[0].id.clone();

        let now = Utc::now();
        assert!(
            settle_card_result(&pool, &result_id, SettleOutcome::Win, 0.667, now)
                .await
                .unwrap()
        );
        // second settle attempt must be rejected
        assert!(
            !settle_card_result(&pool, &result_id, SettleOutcome::Loss, -1.0, now)
                .await
                .unwrap()
        );

        let row = get_card_result(&pool, &result_id).await.unwrap().unwrap();
        assert_eq!(row.status, "settled");
        assert_eq!(row.result.as_deref(), Some("win"));
        assert!((row.pnl_units.unwrap() - 0.667).abs() < 1e-9);
        assert_eq!(row.card_id, card_id);
    }

    #[tokio::test]
    async fn active_cards_dedup_latest_per_type() {
        let pool = test_pool().await;
        let game_id = seed_game(&pool, "401559103").await;

        let mut early = sample_card(&game_id, Some("nhl|tminus|401559103|120"));
        early.created_at = Utc::now() - chrono::Duration::hours(1);
        let late = sample_card(&game_id, Some("nhl|tminus|401559103|30"));

        prepare_model_and_card_write(&pool, &early).await.unwrap();
        prepare_model_and_card_write(&pool, &late).await.unwrap();

        let all = active_cards_for_game(&pool, &game_id, Utc::now(), None, CardDedup::None)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let deduped = active_cards_for_game(
            &pool,
            &game_id,
            Utc::now(),
            None,
            CardDedup::LatestPerGameType,
        )
        .await
        .unwrap();
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].created_at, late.created_at);
    }

    #[tokio::test]
    async fn tracking_stats_accumulate() {
        let pool = test_pool().await;
        apply_tracking_delta(&pool, "nhl", SettleOutcome::Win, 0.667)
            .await
            .unwrap();
        apply_tracking_delta(&pool, "nhl", SettleOutcome::Loss, -1.0)
            .await
            .unwrap();
        apply_tracking_delta(&pool, "nhl", SettleOutcome::Push, 0.0)
            .await
            .unwrap();

        let stats = get_tracking_stats(&pool, "nhl").await.unwrap().unwrap();
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.pushes, 1);
        assert!((stats.units - (-0.333)).abs() < 1e-9);
    }

    #[test]
    fn category_from_card_type() {
        assert_eq!(card_category("nhl-game-call"), "call");
        assert_eq!(card_category("nhl-goalie"), "driver");
        assert_eq!(card_category("nba-pace-matchup"), "driver");
    }
}
