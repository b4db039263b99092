//! Card construction: envelope assembly, declarative per-type schema
//! validation, expiry, and the idempotent write through the store.

pub mod schema;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use crate::db::cards::{prepare_model_and_card_write, CardWriteOutcome, NewCard};
use crate::drivers::{model_name, model_version, DriverDescriptor};
use crate::errors::PipelineError;
use crate::models::{
    BetType, Game, OddsSnapshot, PredictionSide, RecommendationType, Sport,
};

const DISCLAIMER: &str =
    "Analytics output for informational purposes only. Not betting advice.";

/// A validated card ready for persistence.
#[derive(Debug, Clone)]
pub struct BuiltCard {
    pub card_type: String,
    pub card_title: String,
    pub payload: Value,
    pub expires_at: Option<DateTime<Utc>>,
    pub recommended_bet_type: BetType,
    pub recommendation: RecommendationType,
    pub confidence: f64,
    pub prediction: PredictionSide,
}

/// Assemble and validate the canonical payload for one descriptor.
///
/// Returns Ok(None) for descriptors that must never become cards: NEUTRAL
/// with no bet direction is an abstention, not an error.
pub fn build_card(
    descriptor: &DriverDescriptor,
    game: &Game,
    snapshot: &OddsSnapshot,
    sport: Sport,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<Option<BuiltCard>> {
    // abstentions: no market to express, or no direction to express on it
    let Some(bet_type) = descriptor.recommended_bet_type else {
        return Ok(None);
    };
    if descriptor.prediction == PredictionSide::Neutral {
        return Ok(None);
    }

    let recommendation = derive_recommendation(descriptor, bet_type);
    let recommendation_text = recommendation_text(descriptor, game, snapshot, bet_type, recommendation);

    let start_local = game.game_time_utc.with_timezone(&tz);
    let expires_at = card_expiry(game.game_time_utc, now);

    let edge = descriptor.projection.win_prob_home.and_then(|prob| {
        let (model_prob, price) = match descriptor.prediction {
            PredictionSide::Home => (prob, snapshot.moneyline_home),
            PredictionSide::Away => (1.0 - prob, snapshot.moneyline_away),
            _ => return None,
        };
        let implied = price.and_then(crate::drivers::american_to_prob)?;
        Some(model_prob - implied)
    });

    let payload = json!({
        "schema_version": 1,
        "game_id": game.id,
        "sport": sport.as_str(),
        "model_version": model_version(sport),
        "home_team": game.home_team,
        "away_team": game.away_team,
        "matchup": format!("{} @ {}", game.away_team, game.home_team),
        "start_time_utc": game.game_time_utc.to_rfc3339(),
        "start_time_local": start_local.format("%Y-%m-%d %H:%M").to_string(),
        "timezone": tz.name(),
        "countdown": countdown_text(game.game_time_utc, now),
        "recommendation": recommendation_block(descriptor, recommendation, &recommendation_text),
        "projection": serde_json::to_value(&descriptor.projection)?,
        "market": {
            "h2h_home": snapshot.moneyline_home,
            "h2h_away": snapshot.moneyline_away,
            "total": snapshot.total_line,
            "spread_home": snapshot.spread_home,
            "spread_away": snapshot.spread_away,
        },
        "edge": edge,
        "confidence_pct": (descriptor.confidence * 100.0).round() as i64,
        "drivers_active": [descriptor.driver_key],
        "prediction": descriptor.prediction.as_str(),
        "confidence": descriptor.confidence,
        "recommended_bet_type": bet_type.as_str(),
        "tier": descriptor.tier.map(|t| t.as_str()),
        "reasoning": descriptor.reasoning,
        "odds_context": {
            "h2h_home": snapshot.moneyline_home,
            "h2h_away": snapshot.moneyline_away,
            "spread_home": snapshot.spread_home,
            "spread_away": snapshot.spread_away,
            "total": snapshot.total_line,
            "captured_at": snapshot.captured_at.to_rfc3339(),
        },
        "ev_passed": descriptor.ev_threshold_passed,
        "disclaimer": DISCLAIMER,
        "generated_at": now.to_rfc3339(),
        "driver": {
            "key": descriptor.driver_key,
            "score": descriptor.driver_score,
            "status": descriptor.driver_status.as_str(),
            "inputs": serde_json::to_value(&descriptor.driver_inputs)?,
        },
        "driver_summary": {
            "weights": serde_json::to_value(&descriptor.driver_summary)?,
            "impact_note": impact_note(descriptor),
        },
        "meta": {
            "inference_source": "deterministic_v1",
            "is_mock": descriptor.is_mock,
        },
    });

    schema::validate(&descriptor.card_type, &payload).map_err(|detail| {
        PipelineError::SchemaValidation {
            card_type: descriptor.card_type.clone(),
            detail,
        }
    })?;

    Ok(Some(BuiltCard {
        card_type: descriptor.card_type.clone(),
        card_title: descriptor.card_title.clone(),
        payload,
        expires_at,
        recommended_bet_type: bet_type,
        recommendation,
        confidence: descriptor.confidence,
        prediction: descriptor.prediction,
    }))
}

/// Persist a built card with its model output and pending ledger row.
#[allow(clippy::too_many_arguments)]
pub async fn write_card(
    pool: &SqlitePool,
    built: &BuiltCard,
    descriptor: &DriverDescriptor,
    game: &Game,
    sport: Sport,
    snapshot: &OddsSnapshot,
    job_run_id: Option<&str>,
    window_key: Option<&str>,
    now: DateTime<Utc>,
) -> Result<CardWriteOutcome> {
    let new_card = NewCard {
        game_id: game.id.clone(),
        sport: sport.as_str().to_string(),
        card_type: built.card_type.clone(),
        card_title: built.card_title.clone(),
        payload_data: built.payload.clone(),
        created_at: now,
        expires_at: built.expires_at,
        recommended_bet_type: built.recommended_bet_type,
        model_name: model_name(sport),
        model_version: model_version(sport),
        prediction_type: built.prediction.as_str().to_string(),
        confidence: built.confidence,
        output: json!({
            "driver_key": descriptor.driver_key,
            "driver_score": descriptor.driver_score,
            "driver_status": descriptor.driver_status.as_str(),
            "prediction": built.prediction.as_str(),
        }),
        odds_snapshot_id: Some(snapshot.id.clone()),
        job_run_id: job_run_id.map(String::from),
        window_key: window_key.map(String::from),
        metadata: Some(json!({
            "confidence": built.confidence,
            "tier": descriptor.tier.map(|t| t.as_str()),
            "category": crate::db::cards::card_category(&built.card_type),
            "recommendation": built.recommendation.as_str(),
        })),
    };
    prepare_model_and_card_write(pool, &new_card).await
}

/// expires_at is game start minus one hour when that still lies ahead of
/// creation; otherwise the game start itself. Never at or before created_at.
fn card_expiry(game_time_utc: DateTime<Utc>, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let preferred = game_time_utc - Duration::hours(1);
    if preferred > created_at {
        Some(preferred)
    } else if game_time_utc > created_at {
        Some(game_time_utc)
    } else {
        None
    }
}

fn derive_recommendation(
    descriptor: &DriverDescriptor,
    bet_type: BetType,
) -> RecommendationType {
    if !descriptor.ev_threshold_passed {
        return RecommendationType::Pass;
    }
    match (descriptor.prediction, bet_type) {
        (PredictionSide::Home, BetType::Moneyline) => RecommendationType::MlHome,
        (PredictionSide::Away, BetType::Moneyline) => RecommendationType::MlAway,
        (PredictionSide::Home, BetType::Spread) => RecommendationType::SpreadHome,
        (PredictionSide::Away, BetType::Spread) => RecommendationType::SpreadAway,
        (PredictionSide::Over, BetType::Total) => RecommendationType::TotalOver,
        (PredictionSide::Under, BetType::Total) => RecommendationType::TotalUnder,
        // a directional lean on a market it cannot express becomes a pass
        _ => RecommendationType::Pass,
    }
}

fn recommendation_block(
    descriptor: &DriverDescriptor,
    recommendation: RecommendationType,
    text: &str,
) -> Value {
    let mut block = json!({
        "type": recommendation.as_str(),
        "text": text,
    });
    if recommendation == RecommendationType::Pass {
        let reason = if !descriptor.ev_threshold_passed {
            "ev_threshold_not_met"
        } else {
            "no_market_fit"
        };
        block["pass_reason"] = json!(reason);
    }
    block
}

fn recommendation_text(
    descriptor: &DriverDescriptor,
    game: &Game,
    snapshot: &OddsSnapshot,
    bet_type: BetType,
    recommendation: RecommendationType,
) -> String {
    if recommendation == RecommendationType::Pass {
        return "Pass".to_string();
    }
    let fmt_price = |p: Option<f64>| match p {
        Some(p) if p > 0.0 => format!("+{:.0}", p),
        Some(p) => format!("{:.0}", p),
        None => "N/A".to_string(),
    };
    match (descriptor.prediction, bet_type) {
        (PredictionSide::Home, BetType::Moneyline) => {
            format!("{} ML ({})", game.home_team, fmt_price(snapshot.moneyline_home))
        }
        (PredictionSide::Away, BetType::Moneyline) => {
            format!("{} ML ({})", game.away_team, fmt_price(snapshot.moneyline_away))
        }
        (PredictionSide::Home, BetType::Spread) => format!(
            "{} {}",
            game.home_team,
            snapshot
                .spread_home
                .map(|s| format!("{:+.1}", s))
                .unwrap_or_else(|| "spread".to_string())
        ),
        (PredictionSide::Away, BetType::Spread) => format!(
            "{} {}",
            game.away_team,
            snapshot
                .spread_away
                .map(|s| format!("{:+.1}", s))
                .unwrap_or_else(|| "spread".to_string())
        ),
        (PredictionSide::Over, BetType::Total) => format!(
            "Over {}",
            snapshot
                .total_line
                .map(|t| format!("{:.1}", t))
                .unwrap_or_else(|| "total".to_string())
        ),
        (PredictionSide::Under, BetType::Total) => format!(
            "Under {}",
            snapshot
                .total_line
                .map(|t| format!("{:.1}", t))
                .unwrap_or_else(|| "total".to_string())
        ),
        _ => "Pass".to_string(),
    }
}

fn countdown_text(game_time_utc: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let remaining = game_time_utc - now;
    if remaining.num_seconds() <= 0 {
        return "started".to_string();
    }
    let hours = remaining.num_hours();
    let minutes = remaining.num_minutes() - hours * 60;
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

fn impact_note(descriptor: &DriverDescriptor) -> String {
    if descriptor.driver_summary.is_empty() {
        return "single-driver card".to_string();
    }
    let top = descriptor
        .driver_summary
        .iter()
        .max_by(|a, b| {
            a.impact
                .abs()
                .partial_cmp(&b.impact.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|c| c.driver.clone())
        .unwrap_or_default();
    format!("largest contribution from {}", top)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::test_support::{game, metrics, snapshot};
    use crate::drivers::{compute_drivers, DriverGameContext};
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 27, 16, 0, 0).unwrap()
    }

    fn built_goalie_card() -> (BuiltCard, DriverDescriptor, Game, OddsSnapshot) {
        let g = game(Sport::Nhl, "401559300");
        let snap = snapshot(&g.id);
        let home = metrics(3.2, 2.4, 2, None);
        let away = metrics(2.9, 3.6, 1, None);
        let ctx = DriverGameContext {
            game: &g,
            snapshot: &snap,
            home: &home,
            away: &away,
        };
        let descriptor = compute_drivers(Sport::Nhl, &ctx)
            .into_iter()
            .find(|d| d.card_type == "nhl-goalie")
            .expect("goalie descriptor");
        let built = build_card(
            &descriptor,
            &g,
            &snap,
            Sport::Nhl,
            chrono_tz::America::New_York,
            fixed_now(),
        )
        .unwrap()
        .expect("card built");
        (built, descriptor, g, snap)
    }

    #[test]
    fn envelope_carries_required_blocks() {
        let (built, _, g, snap) = built_goalie_card();
        let p = &built.payload;

        assert_eq!(p["game_id"], g.id);
        assert_eq!(p["matchup"], "Away Club @ Home Club");
        assert_eq!(p["timezone"], "America/New_York");
        assert_eq!(p["odds_context"]["h2h_home"], snap.moneyline_home.unwrap());
        assert_eq!(p["meta"]["inference_source"], "deterministic_v1");
        assert_eq!(p["schema_version"], 1);
        assert_eq!(p["countdown"], "4h 0m");
        // 20:00 UTC game -> 15:00 ET local
        assert_eq!(p["start_time_local"], "2026-02-27 15:00");
        let pct = p["confidence_pct"].as_i64().unwrap();
        assert!((0..=100).contains(&pct));
    }

    #[test]
    fn expiry_is_one_hour_before_start() {
        let (built, _, g, _) = built_goalie_card();
        assert_eq!(
            built.expires_at,
            Some(g.game_time_utc - Duration::hours(1))
        );
    }

    #[test]
    fn expiry_never_precedes_creation() {
        let start = Utc.with_ymd_and_hms(2026, 2, 27, 16, 30, 0).unwrap();
        let created = Utc.with_ymd_and_hms(2026, 2, 27, 16, 0, 0).unwrap();
        // inside the final hour: fall back to game start
        assert_eq!(card_expiry(start, created), Some(start));
        // game already started: no expiry
        let started = Utc.with_ymd_and_hms(2026, 2, 27, 15, 0, 0).unwrap();
        assert_eq!(card_expiry(started, created), None);
        for expires in card_expiry(start, created) {
            assert!(expires > created);
        }
    }

    #[test]
    fn ev_failure_becomes_pass() {
        let (_, mut descriptor, g, snap) = built_goalie_card();
        descriptor.ev_threshold_passed = false;
        let built = build_card(
            &descriptor,
            &g,
            &snap,
            Sport::Nhl,
            chrono_tz::America::New_York,
            fixed_now(),
        )
        .unwrap()
        .expect("card built");
        assert_eq!(built.recommendation, RecommendationType::Pass);
        assert_eq!(
            built.payload["recommendation"]["pass_reason"],
            "ev_threshold_not_met"
        );
    }

    #[test]
    fn neutral_without_direction_builds_no_card() {
        let (_, mut descriptor, g, snap) = built_goalie_card();
        descriptor.prediction = PredictionSide::Neutral;
        descriptor.recommended_bet_type = None;
        let built = build_card(
            &descriptor,
            &g,
            &snap,
            Sport::Nhl,
            chrono_tz::America::New_York,
            fixed_now(),
        )
        .unwrap();
        assert!(built.is_none());
    }

    #[test]
    fn unknown_card_type_is_hard_error() {
        let (_, mut descriptor, g, snap) = built_goalie_card();
        descriptor.card_type = "nhl-zamboni".to_string();
        let err = build_card(
            &descriptor,
            &g,
            &snap,
            Sport::Nhl,
            chrono_tz::America::New_York,
            fixed_now(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("nhl-zamboni"));
    }

    #[test]
    fn countdown_formats() {
        let start = Utc.with_ymd_and_hms(2026, 2, 27, 20, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 2, 27, 19, 15, 0).unwrap();
        assert_eq!(countdown_text(start, now), "45m");
        let now = Utc.with_ymd_and_hms(2026, 2, 27, 21, 0, 0).unwrap();
        assert_eq!(countdown_text(start, now), "started");
    }
}
