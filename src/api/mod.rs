//! Read API: active cards alongside odds, plus the settlement ledger.
//! Reads the store directly; all writes belong to the jobs.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::AppConfig;
use crate::db::{self, cards::CardDedup, cards::LedgerFilter, cards::LedgerRow};
use crate::models::{ApiResponse, CardPayload, Game, OddsSnapshot};

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub config: Arc<AppConfig>,
}

pub async fn serve(
    state: ApiState,
    cancel: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let port = state.config.server_port;
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!(port, "read API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/games", get(games_handler))
        .route("/cards/{game_id}", get(cards_handler))
        .route("/results", get(results_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

type Failure = (StatusCode, Json<ApiResponse<()>>);

fn internal_error(e: impl std::fmt::Display) -> Failure {
    tracing::error!(error = %e, "read API query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::error(e.to_string())),
    )
}

async fn health_handler() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::success("ok"))
}

// ── GET /games ────────────────────────────────────────────────────────────────

const GAMES_CAP: i64 = 200;

#[derive(Debug, Serialize)]
struct GameWithContext {
    #[serde(flatten)]
    game: Game,
    latest_odds: Option<OddsSnapshot>,
    cards: Vec<CardView>,
}

#[derive(Debug, Serialize)]
struct CardView {
    id: String,
    card_type: String,
    card_title: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    payload: serde_json::Value,
}

fn card_view(card: CardPayload) -> CardView {
    let payload = serde_json::from_str(&card.payload_data).unwrap_or(serde_json::Value::Null);
    CardView {
        id: card.id,
        card_type: card.card_type,
        card_title: card.card_title,
        created_at: card.created_at,
        expires_at: card.expires_at,
        payload,
    }
}

/// Local midnight in the scheduling timezone, as a UTC instant.
fn local_midnight_utc(config: &AppConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&config.timezone);
    config
        .timezone
        .with_ymd_and_hms(
            chrono::Datelike::year(&local),
            chrono::Datelike::month(&local),
            chrono::Datelike::day(&local),
            0,
            0,
            0,
        )
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(now)
}

async fn games_handler(
    State(state): State<ApiState>,
) -> Result<Json<ApiResponse<Vec<GameWithContext>>>, Failure> {
    let now = Utc::now();
    let from = local_midnight_utc(&state.config, now);
    let games = db::games_from(&state.pool, from, GAMES_CAP)
        .await
        .map_err(internal_error)?;

    let mut out = Vec::with_capacity(games.len());
    for game in games {
        let latest_odds = db::latest_snapshot_for_game(&state.pool, &game.id)
            .await
            .map_err(internal_error)?;
        let cards = db::cards::active_cards_for_game(
            &state.pool,
            &game.id,
            now,
            None,
            CardDedup::LatestPerGameType,
        )
        .await
        .map_err(internal_error)?;
        out.push(GameWithContext {
            game,
            latest_odds,
            cards: cards.into_iter().map(card_view).collect(),
        });
    }
    Ok(Json(ApiResponse::success(out)))
}

// ── GET /cards/{game_id} ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CardsQuery {
    card_type: Option<String>,
    dedup: Option<String>,
}

async fn cards_handler(
    State(state): State<ApiState>,
    Path(game_id): Path<String>,
    Query(params): Query<CardsQuery>,
) -> Result<Json<ApiResponse<Vec<CardView>>>, Failure> {
    let dedup = match params.dedup.as_deref() {
        None | Some("latest_per_game_type") => CardDedup::LatestPerGameType,
        Some("none") => CardDedup::None,
        Some(other) => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(format!("unknown dedup mode '{}'", other))),
            ))
        }
    };

    let cards = db::cards::active_cards_for_game(
        &state.pool,
        &game_id,
        Utc::now(),
        params.card_type.as_deref(),
        dedup,
    )
    .await
    .map_err(internal_error)?;
    Ok(Json(ApiResponse::success(
        cards.into_iter().map(card_view).collect(),
    )))
}

// ── GET /results ──────────────────────────────────────────────────────────────

const RECENT_LEDGER_CAP: usize = 50;

#[derive(Debug, Deserialize)]
struct ResultsQuery {
    sport: Option<String>,
    card_category: Option<String>,
    min_confidence: Option<f64>,
    market: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct ResultsSummary {
    wins: i64,
    losses: i64,
    pushes: i64,
    units: f64,
    win_rate: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ResultsSegment {
    sport: String,
    category: String,
    market: String,
    wins: i64,
    losses: i64,
    pushes: i64,
    units: f64,
}

#[derive(Debug, Serialize)]
struct ResultsResponse {
    summary: ResultsSummary,
    segments: Vec<ResultsSegment>,
    recent: Vec<LedgerRow>,
}

async fn results_handler(
    State(state): State<ApiState>,
    Query(params): Query<ResultsQuery>,
) -> Result<Json<ApiResponse<ResultsResponse>>, Failure> {
    if let Some(category) = params.card_category.as_deref() {
        if !matches!(category, "driver" | "call") {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(format!(
                    "unknown card_category '{}'",
                    category
                ))),
            ));
        }
    }

    let filter = LedgerFilter {
        sport: params.sport,
        card_category: params.card_category,
        min_confidence: params.min_confidence,
        market: params.market,
    };
    let rows = db::cards::settled_ledger(&state.pool, &filter)
        .await
        .map_err(internal_error)?;

    Ok(Json(ApiResponse::success(summarize(rows))))
}

fn summarize(rows: Vec<LedgerRow>) -> ResultsResponse {
    let mut summary = ResultsSummary::default();
    let mut segments: std::collections::BTreeMap<(String, String, String), ResultsSegment> =
        std::collections::BTreeMap::new();

    for row in &rows {
        let units = row.pnl_units.unwrap_or(0.0);
        summary.units += units;

        let segment = segments
            .entry((
                row.sport.clone(),
                db::cards::card_category(&row.card_type).to_string(),
                row.market.clone(),
            ))
            .or_insert_with_key(|(sport, category, market)| ResultsSegment {
                sport: sport.clone(),
                category: category.clone(),
                market: market.clone(),
                wins: 0,
                losses: 0,
                pushes: 0,
                units: 0.0,
            });
        segment.units += units;

        match row.result.as_deref() {
            Some("win") => {
                summary.wins += 1;
                segment.wins += 1;
            }
            Some("loss") => {
                summary.losses += 1;
                segment.losses += 1;
            }
            Some("push") => {
                summary.pushes += 1;
                segment.pushes += 1;
            }
            // void rows carry zero units and do not count toward the record
            _ => {}
        }
    }

    let decided = summary.wins + summary.losses;
    summary.win_rate = if decided > 0 {
        Some(summary.wins as f64 / decided as f64)
    } else {
        None
    };

    ResultsResponse {
        summary,
        segments: segments.into_values().collect(),
        recent: rows.into_iter().take(RECENT_LEDGER_CAP).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(sport: &str, card_type: &str, market: &str, result: &str, pnl: f64) -> LedgerRow {
        LedgerRow {
            card_id: "c".to_string(),
            game_id: "g".to_string(),
            sport: sport.to_string(),
            card_type: card_type.to_string(),
            market: market.to_string(),
            result: Some(result.to_string()),
            pnl_units: Some(pnl),
            settled_at: Some(Utc::now()),
            confidence: Some(0.7),
        }
    }

    #[test]
    fn summary_counts_and_win_rate() {
        let rows = vec![
            row("nhl", "nhl-goalie", "moneyline", "win", 0.667),
            row("nhl", "nhl-goalie", "moneyline", "loss", -1.0),
            row("nhl", "nhl-game-call", "moneyline", "win", 0.9),
            row("nba", "nba-pace-matchup", "total", "push", 0.0),
            row("nba", "nba-rest", "spread", "void", 0.0),
        ];
        let resp = summarize(rows);

        assert_eq!(resp.summary.wins, 2);
        assert_eq!(resp.summary.losses, 1);
        assert_eq!(resp.summary.pushes, 1);
        assert!((resp.summary.units - 0.567).abs() < 1e-9);
        assert!((resp.summary.win_rate.unwrap() - 2.0 / 3.0).abs() < 1e-9);

        // nhl driver ml, nhl call ml, nba driver total, nba driver spread
        assert_eq!(resp.segments.len(), 4);
        let call_segment = resp
            .segments
            .iter()
            .find(|s| s.category == "call")
            .unwrap();
        assert_eq!(call_segment.sport, "nhl");
        assert_eq!(call_segment.wins, 1);
    }

    #[test]
    fn empty_ledger_has_no_win_rate() {
        let resp = summarize(Vec::new());
        assert_eq!(resp.summary.win_rate, None);
        assert!(resp.segments.is_empty());
        assert!(resp.recent.is_empty());
    }
}
