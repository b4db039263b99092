//! Two-phase settlement.
//!
//! Phase 1 grades games: final scores are pulled from the public scoreboard
//! for every stored game old enough to have ended. Phase 2 grades cards:
//! pending ledger rows joined to final scores settle under per-market rules
//! at the captured decision-time price.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use crate::config::AppConfig;
use crate::db;
use crate::errors::PipelineError;
use crate::models::{GameResult, RecommendationType, SettleOutcome, Sport};

/// Assumed price on spread/total markets when no price was captured.
const FALLBACK_PRICE: f64 = -110.0;

/// How far back phase 1 looks for ungraded games.
const GRADE_LOOKBACK_HOURS: i64 = 72;

// ── Scoreboard source ─────────────────────────────────────────────────────────

pub struct ScoreboardClient {
    client: reqwest::Client,
    base_url: String,
}

impl ScoreboardClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://site.api.espn.com/apis/site/v2/sports".to_string(),
        }
    }

    #[allow(dead_code)]
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn scoreboard(&self, sport: Sport, date: NaiveDate) -> Result<Value> {
        let url = format!(
            "{}/{}/scoreboard?dates={}",
            self.base_url,
            sport.scoreboard_path(),
            date.format("%Y%m%d")
        );
        let body = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(15))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body)
    }
}

/// One event as reported by the scoreboard.
#[derive(Debug, Clone)]
pub struct ScoredEvent {
    pub home_team: String,
    pub away_team: String,
    pub home_score: i64,
    pub away_score: i64,
    pub start: DateTime<Utc>,
    pub completed: bool,
    pub abandoned: bool,
}

pub fn parse_scoreboard(body: &Value) -> Vec<ScoredEvent> {
    let mut out = Vec::new();
    let events = body
        .get("events")
        .and_then(|e| e.as_array())
        .cloned()
        .unwrap_or_default();

    for event in &events {
        let Some(start) = event
            .get("date")
            .and_then(|d| d.as_str())
            .and_then(parse_scoreboard_date)
        else {
            continue;
        };
        let status_name = event
            .get("status")
            .and_then(|s| s.get("type"))
            .and_then(|t| t.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("");
        let completed = event
            .get("status")
            .and_then(|s| s.get("type"))
            .and_then(|t| t.get("completed"))
            .and_then(|c| c.as_bool())
            .unwrap_or(false);
        let abandoned = matches!(
            status_name,
            "STATUS_POSTPONED" | "STATUS_CANCELED" | "STATUS_CANCELLED" | "STATUS_FORFEIT"
        );

        let Some(competitors) = event
            .get("competitions")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("competitors"))
            .and_then(|c| c.as_array())
        else {
            continue;
        };

        let mut home = None;
        let mut away = None;
        for comp in competitors {
            let name = comp
                .get("team")
                .and_then(|t| t.get("displayName"))
                .and_then(|n| n.as_str())
                .unwrap_or("")
                .to_string();
            let score = comp
                .get("score")
                .and_then(|s| s.as_str().and_then(|raw| raw.parse::<i64>().ok()).or(s.as_i64()))
                .unwrap_or(0);
            match comp.get("homeAway").and_then(|h| h.as_str()) {
                Some("home") => home = Some((name, score)),
                Some("away") => away = Some((name, score)),
                _ => {}
            }
        }
        let (Some((home_team, home_score)), Some((away_team, away_score))) = (home, away) else {
            continue;
        };

        out.push(ScoredEvent {
            home_team,
            away_team,
            home_score,
            away_score,
            start,
            completed,
            abandoned,
        });
    }
    out
}

fn parse_scoreboard_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%MZ")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Fuzzy team-name match: normalize common suffixes, then contains-both-ways.
pub fn names_match(a: &str, b: &str) -> bool {
    let norm = |s: &str| -> String {
        s.to_lowercase()
            .replace(" fc", "")
            .replace("fc ", "")
            .replace(".", "")
            .replace("-", " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    };
    let a = norm(a);
    let b = norm(b);
    !a.is_empty() && !b.is_empty() && (a == b || a.contains(&b) || b.contains(&a))
}

// ── Phase 1: game grading ─────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq, Eq)]
pub struct GameGradingReport {
    pub graded: i64,
    pub voided_cards: i64,
    pub unresolved: i64,
}

pub async fn grade_games(
    pool: &SqlitePool,
    config: &AppConfig,
    client: &ScoreboardClient,
    now: DateTime<Utc>,
) -> Result<GameGradingReport> {
    let mut report = GameGradingReport::default();
    let games = db::games_awaiting_result(
        pool,
        now,
        config.min_hours_after_start,
        GRADE_LOOKBACK_HOURS,
    )
    .await?;
    if games.is_empty() {
        return Ok(report);
    }

    // one scoreboard call per (sport, calendar date) actually needed
    let mut boards: std::collections::HashMap<(String, NaiveDate), Vec<ScoredEvent>> =
        std::collections::HashMap::new();

    for game in &games {
        let Some(sport) = Sport::from_str_loose(&game.sport) else {
            continue;
        };
        let date = game.game_time_utc.date_naive();
        let key = (game.sport.clone(), date);
        if !boards.contains_key(&key) {
            match client.scoreboard(sport, date).await {
                Ok(body) => {
                    boards.insert(key.clone(), parse_scoreboard(&body));
                }
                Err(e) => {
                    tracing::warn!(sport = %game.sport, %date, error = %e, "scoreboard fetch failed");
                    boards.insert(key.clone(), Vec::new());
                }
            }
        }
        let events = boards.get(&key).map(Vec::as_slice).unwrap_or_default();

        let matched = events.iter().find(|event| {
            names_match(&event.home_team, &game.home_team)
                && names_match(&event.away_team, &game.away_team)
                && (event.start - game.game_time_utc).num_hours().abs() <= 4
        });

        match matched {
            Some(event) if event.completed => {
                db::upsert_game_result(
                    pool,
                    &game.id,
                    event.home_score,
                    event.away_score,
                    "final",
                    now,
                )
                .await?;
                db::mark_game_final(pool, &game.id).await?;
                report.graded += 1;
                tracing::info!(
                    game_id = game.id,
                    home = event.home_score,
                    away = event.away_score,
                    "game graded final"
                );
            }
            Some(event) if event.abandoned => {
                report.voided_cards += void_pending_cards(pool, &game.id, now).await?;
            }
            // in progress or absent from the response: try again next run
            _ => report.unresolved += 1,
        }
    }
    Ok(report)
}

/// Postponed or cancelled: pending cards settle void at zero units. The game
/// row stays untouched so a rescheduled event can still be graded later.
async fn void_pending_cards(
    pool: &SqlitePool,
    game_id: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    let pending = db::cards::pending_results_for_game(pool, game_id).await?;
    let mut voided = 0i64;
    for row in pending {
        if db::cards::settle_card_result(pool, &row.id, SettleOutcome::Void, 0.0, now).await? {
            db::cards::apply_tracking_delta(pool, &row.sport, SettleOutcome::Void, 0.0).await?;
            voided += 1;
        }
    }
    if voided > 0 {
        tracing::info!(game_id, voided, "pending cards voided for abandoned game");
    }
    Ok(voided)
}

// ── Phase 2: card grading ─────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CardGradingReport {
    pub settled: i64,
    pub errors: i64,
}

pub async fn grade_cards(pool: &SqlitePool, now: DateTime<Utc>) -> Result<CardGradingReport> {
    let mut report = CardGradingReport::default();
    let rows = db::cards::pending_results_with_finals(pool).await?;

    for (card_result, game_result) in rows {
        match grade_one(pool, &card_result, &game_result, now).await {
            Ok(true) => report.settled += 1,
            Ok(false) => {}
            Err(e) => {
                report.errors += 1;
                tracing::warn!(
                    card_id = card_result.card_id,
                    game_id = card_result.game_id,
                    error = %e,
                    "card grading failed, skipping"
                );
            }
        }
    }
    Ok(report)
}

async fn grade_one(
    pool: &SqlitePool,
    card_result: &crate::models::CardResult,
    game_result: &GameResult,
    now: DateTime<Utc>,
) -> Result<bool> {
    let card = db::cards::get_card(pool, &card_result.card_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("card payload {} missing", card_result.card_id))?;
    let payload: Value = serde_json::from_str(&card.payload_data)?;

    let (outcome, pnl) = grade_payload(&payload, game_result.home_score, game_result.away_score)?;

    let applied = db::cards::settle_card_result(pool, &card_result.id, outcome, pnl, now).await?;
    if applied {
        db::cards::apply_tracking_delta(pool, &card_result.sport, outcome, pnl).await?;
        tracing::info!(
            card_id = card_result.card_id,
            game_id = card_result.game_id,
            sport = card_result.sport,
            result = outcome.as_str(),
            pnl_units = pnl,
            "card settled"
        );
    }
    Ok(applied)
}

/// Pure per-market grading over the persisted payload.
pub fn grade_payload(
    payload: &Value,
    home_score: i64,
    away_score: i64,
) -> Result<(SettleOutcome, f64)> {
    let recommendation = payload
        .get("recommendation")
        .and_then(|r| r.get("type"))
        .and_then(|t| t.as_str())
        .ok_or_else(|| PipelineError::MissingInput("recommendation.type".to_string()))?;
    let prediction = payload
        .get("prediction")
        .and_then(|p| p.as_str())
        .unwrap_or("");
    let odds = payload
        .get("odds_context")
        .ok_or_else(|| PipelineError::MissingInput("odds_context".to_string()))?;

    let recommendation = match recommendation {
        "ML_HOME" => RecommendationType::MlHome,
        "ML_AWAY" => RecommendationType::MlAway,
        "SPREAD_HOME" => RecommendationType::SpreadHome,
        "SPREAD_AWAY" => RecommendationType::SpreadAway,
        "TOTAL_OVER" => RecommendationType::TotalOver,
        "TOTAL_UNDER" => RecommendationType::TotalUnder,
        "PASS" => RecommendationType::Pass,
        other => {
            return Err(
                PipelineError::ParseFailure(format!("unknown recommendation type {}", other)).into(),
            )
        }
    };

    if recommendation == RecommendationType::Pass || prediction == "NEUTRAL" {
        return Ok((SettleOutcome::Void, 0.0));
    }

    let field = |name: &str| odds.get(name).and_then(|v| v.as_f64());

    let graded = match recommendation {
        RecommendationType::MlHome | RecommendationType::MlAway => {
            let home_side = recommendation == RecommendationType::MlHome;
            let price = if home_side {
                field("h2h_home")
            } else {
                field("h2h_away")
            };
            grade_moneyline(home_side, price, home_score, away_score)
        }
        RecommendationType::SpreadHome => {
            let line = field("spread_home")
                .ok_or_else(|| PipelineError::MissingInput("odds_context.spread_home".to_string()))?;
            let adjusted = home_score as f64 + line - away_score as f64;
            grade_line(adjusted, field("spread_price"))
        }
        RecommendationType::SpreadAway => {
            let line = field("spread_away")
                .ok_or_else(|| PipelineError::MissingInput("odds_context.spread_away".to_string()))?;
            let adjusted = away_score as f64 + line - home_score as f64;
            grade_line(adjusted, field("spread_price"))
        }
        RecommendationType::TotalOver | RecommendationType::TotalUnder => {
            let line =
                field("total")
                .ok_or_else(|| PipelineError::MissingInput("odds_context.total".to_string()))?;
            let sum = (home_score + away_score) as f64;
            let diff = if recommendation == RecommendationType::TotalOver {
                sum - line
            } else {
                line - sum
            };
            grade_line(diff, field("total_price"))
        }
        RecommendationType::Pass => unreachable!("handled above"),
    };
    Ok(graded)
}

fn grade_moneyline(
    home_side: bool,
    price: Option<f64>,
    home_score: i64,
    away_score: i64,
) -> (SettleOutcome, f64) {
    if home_score == away_score {
        return (SettleOutcome::Push, 0.0);
    }
    let home_won = home_score > away_score;
    if home_won == home_side {
        (SettleOutcome::Win, moneyline_profit(price.unwrap_or(FALLBACK_PRICE)))
    } else {
        (SettleOutcome::Loss, -1.0)
    }
}

/// Positive margin wins, zero pushes, negative loses; price defaults to -110.
fn grade_line(margin: f64, price: Option<f64>) -> (SettleOutcome, f64) {
    if margin == 0.0 {
        (SettleOutcome::Push, 0.0)
    } else if margin > 0.0 {
        (SettleOutcome::Win, moneyline_profit(price.unwrap_or(FALLBACK_PRICE)))
    } else {
        (SettleOutcome::Loss, -1.0)
    }
}

/// Unit profit on a winning American-odds bet: +X pays X/100, -X pays 100/X.
pub fn moneyline_profit(price: f64) -> f64 {
    if price > 0.0 {
        price / 100.0
    } else {
        100.0 / price.abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(recommendation: &str, prediction: &str, odds: Value) -> Value {
        json!({
            "recommendation": {"type": recommendation, "text": "t"},
            "prediction": prediction,
            "odds_context": odds,
        })
    }

    #[test]
    fn moneyline_unit_math() {
        assert!((moneyline_profit(150.0) - 1.5).abs() < 1e-9);
        assert!((moneyline_profit(-150.0) - 0.6667).abs() < 1e-3);
        assert!((moneyline_profit(-110.0) - 0.909).abs() < 1e-3);
    }

    #[test]
    fn ml_home_favorite_win() {
        let p = payload("ML_HOME", "HOME", json!({"h2h_home": -150.0, "h2h_away": 130.0}));
        let (outcome, pnl) = grade_payload(&p, 4, 2).unwrap();
        assert_eq!(outcome, SettleOutcome::Win);
        assert!((pnl - 0.667).abs() < 0.005);
    }

    #[test]
    fn ml_home_loss_and_tie() {
        let p = payload("ML_HOME", "HOME", json!({"h2h_home": -150.0}));
        let (outcome, pnl) = grade_payload(&p, 1, 3).unwrap();
        assert_eq!(outcome, SettleOutcome::Loss);
        assert_eq!(pnl, -1.0);

        let (outcome, pnl) = grade_payload(&p, 2, 2).unwrap();
        assert_eq!(outcome, SettleOutcome::Push);
        assert_eq!(pnl, 0.0);
    }

    #[test]
    fn ml_away_underdog_win_pays_plus_money() {
        let p = payload("ML_AWAY", "AWAY", json!({"h2h_home": -150.0, "h2h_away": 130.0}));
        let (outcome, pnl) = grade_payload(&p, 1, 2).unwrap();
        assert_eq!(outcome, SettleOutcome::Win);
        assert!((pnl - 1.3).abs() < 1e-9);
    }

    #[test]
    fn total_over_win_loss_push() {
        let p = payload("TOTAL_OVER", "OVER", json!({"total": 6.5}));
        assert_eq!(grade_payload(&p, 4, 3).unwrap().0, SettleOutcome::Win);
        assert_eq!(grade_payload(&p, 3, 3).unwrap().0, SettleOutcome::Loss);

        let p = payload("TOTAL_OVER", "OVER", json!({"total": 6.0}));
        let (outcome, pnl) = grade_payload(&p, 3, 3).unwrap();
        assert_eq!(outcome, SettleOutcome::Push);
        assert_eq!(pnl, 0.0);

        // win at the assumed -110 price
        let (_, pnl) = grade_payload(&p, 4, 3).unwrap();
        assert!((pnl - 0.909).abs() < 1e-3);
    }

    #[test]
    fn total_under_mirrors_over() {
        let p = payload("TOTAL_UNDER", "UNDER", json!({"total": 6.5}));
        assert_eq!(grade_payload(&p, 3, 3).unwrap().0, SettleOutcome::Win);
        assert_eq!(grade_payload(&p, 4, 3).unwrap().0, SettleOutcome::Loss);
    }

    #[test]
    fn spread_home_applies_captured_line() {
        let p = payload("SPREAD_HOME", "HOME", json!({"spread_home": -1.5}));
        // home by 2 covers -1.5
        assert_eq!(grade_payload(&p, 5, 3).unwrap().0, SettleOutcome::Win);
        // home by 1 does not
        assert_eq!(grade_payload(&p, 4, 3).unwrap().0, SettleOutcome::Loss);

        let p = payload("SPREAD_HOME", "HOME", json!({"spread_home": -2.0}));
        assert_eq!(grade_payload(&p, 5, 3).unwrap().0, SettleOutcome::Push);

        let p = payload("SPREAD_AWAY", "AWAY", json!({"spread_away": 1.5}));
        // away losing by 1 covers +1.5
        assert_eq!(grade_payload(&p, 4, 3).unwrap().0, SettleOutcome::Win);
    }

    #[test]
    fn captured_price_overrides_fallback() {
        let p = payload(
            "SPREAD_HOME",
            "HOME",
            json!({"spread_home": -1.5, "spread_price": -120.0}),
        );
        let (_, pnl) = grade_payload(&p, 5, 3).unwrap();
        assert!((pnl - 100.0 / 120.0).abs() < 1e-9);
    }

    #[test]
    fn pass_and_neutral_settle_void() {
        let p = payload("PASS", "HOME", json!({}));
        assert_eq!(grade_payload(&p, 4, 2).unwrap(), (SettleOutcome::Void, 0.0));

        let p = payload("ML_HOME", "NEUTRAL", json!({"h2h_home": -150.0}));
        assert_eq!(grade_payload(&p, 4, 2).unwrap(), (SettleOutcome::Void, 0.0));
    }

    #[test]
    fn scoreboard_parsing_and_matching() {
        let body = json!({
            "events": [{
                "id": "401559000",
                "date": "2026-02-27T20:00Z",
                "status": {"type": {"name": "STATUS_FINAL", "completed": true}},
                "competitions": [{"competitors": [
                    {"homeAway": "home", "score": "4",
                     "team": {"displayName": "Boston Bruins"}},
                    {"homeAway": "away", "score": "2",
                     "team": {"displayName": "Toronto Maple Leafs"}}
                ]}]
            },
            {
                "id": "401559001",
                "date": "2026-02-27T23:00Z",
                "status": {"type": {"name": "STATUS_POSTPONED", "completed": false}},
                "competitions": [{"competitors": [
                    {"homeAway": "home", "score": "0",
                     "team": {"displayName": "Dallas Stars"}},
                    {"homeAway": "away", "score": "0",
                     "team": {"displayName": "Chicago Blackhawks"}}
                ]}]
            }]
        });

        let events = parse_scoreboard(&body);
        assert_eq!(events.len(), 2);
        assert!(events[0].completed);
        assert_eq!(events[0].home_score, 4);
        assert!(!events[1].completed);
        assert!(events[1].abandoned);

        assert!(names_match("Boston Bruins", "boston bruins"));
        assert!(names_match("Bruins", "Boston Bruins"));
        assert!(!names_match("Boston Bruins", "Dallas Stars"));
    }
}
