//! Deterministic per-sport prediction models ("drivers").
//!
//! Every driver is a pure function over the enriched odds for one game. A
//! driver that lacks inputs, or sees no edge, abstains by returning no
//! descriptor at all; the card writer never hears about it.

mod generic;
mod nba;
mod nhl;

use serde::{Deserialize, Serialize};

use crate::models::{
    BetType, DriverStatus, Game, OddsSnapshot, PredictionSide, Sport, Tier,
};
use crate::services::team_metrics::TeamMetrics;

/// Model identity stamped on every output and card.
pub fn model_name(sport: Sport) -> String {
    format!("run_{}_model", sport.as_str())
}

pub fn model_version(sport: Sport) -> String {
    format!("{}_v1", sport.as_str())
}

/// Everything a driver may look at for one game.
pub struct DriverGameContext<'a> {
    pub game: &'a Game,
    pub snapshot: &'a OddsSnapshot,
    pub home: &'a TeamMetrics,
    pub away: &'a TeamMetrics,
}

/// Discriminated inputs blob persisted with each card, keyed by the driver
/// that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverInputs {
    GoalieEdge {
        home_goals_against: f64,
        away_goals_against: f64,
        home_rest_days: Option<i64>,
        away_rest_days: Option<i64>,
    },
    FirstPeriodPace {
        expected_first_period_total: f64,
        market_first_period_total: f64,
        combined_scoring_rate: f64,
    },
    PaceMatchup {
        home_pace_percentile: f64,
        away_pace_percentile: f64,
        synergy: String,
        market_total: f64,
    },
    RestAdvantage {
        home_rest_days: i64,
        away_rest_days: i64,
        back_to_back_side: Option<String>,
    },
    FormEdge {
        home_net_rating: f64,
        away_net_rating: f64,
        home_form: String,
        away_form: String,
    },
    GameComposite {
        weighted_sum: f64,
        components: Vec<SubScore>,
    },
}

/// One row of the composite weights table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubScore {
    pub driver: String,
    pub weight: f64,
    pub score: f64,
    pub impact: f64,
    pub status: DriverStatus,
}

/// Projection block surfaced on the card.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Projection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub margin_home: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub win_prob_home: Option<f64>,
}

/// The structural contract every sport model must satisfy per emitted card.
#[derive(Debug, Clone)]
pub struct DriverDescriptor {
    pub card_type: String,
    pub card_title: String,
    pub driver_key: String,
    pub prediction: PredictionSide,
    pub confidence: f64,
    pub tier: Option<Tier>,
    pub reasoning: String,
    pub driver_score: Option<f64>,
    pub driver_status: DriverStatus,
    pub driver_inputs: DriverInputs,
    pub recommended_bet_type: Option<BetType>,
    pub ev_threshold_passed: bool,
    pub is_mock: bool,
    pub driver_summary: Vec<SubScore>,
    pub projection: Projection,
}

/// Per-sport dispatch. Pure: same inputs, same descriptors.
pub fn compute_drivers(sport: Sport, ctx: &DriverGameContext) -> Vec<DriverDescriptor> {
    match sport {
        Sport::Nhl => nhl::compute(ctx),
        Sport::Nba => nba::compute(ctx),
        Sport::Ncaam | Sport::Mlb | Sport::Nfl | Sport::Soccer | Sport::Fpl => {
            generic::compute(sport, ctx)
        }
    }
}

// ── Shared scoring helpers ────────────────────────────────────────────────────

/// Composite rule: weighted sum over sub-driver scores (weights sum to <= 1;
/// any unassigned weight pulls toward neutral 0.5).
pub fn composite_score(components: &[SubScore]) -> f64 {
    let assigned: f64 = components.iter().map(|c| c.weight).sum();
    let weighted: f64 = components.iter().map(|c| c.weight * c.score).sum();
    weighted + (1.0 - assigned) * 0.5
}

/// prediction = HOME if weighted sum > 0.5, AWAY if < 0.5, NEUTRAL otherwise.
pub fn composite_prediction(weighted_sum: f64) -> PredictionSide {
    if weighted_sum > 0.5 {
        PredictionSide::Home
    } else if weighted_sum < 0.5 {
        PredictionSide::Away
    } else {
        PredictionSide::Neutral
    }
}

pub fn composite_confidence(weighted_sum: f64) -> f64 {
    weighted_sum.clamp(0.50, 0.85)
}

/// Confidence for a driver that signals a direction: deviation from neutral.
pub fn directional_confidence(score: f64) -> f64 {
    (0.5 + (score - 0.5).abs()).min(0.90)
}

/// Confidence for a driver whose raw magnitude is the signal (risk scores
/// and the like).
pub fn magnitude_confidence(score: f64) -> f64 {
    score.clamp(0.0, 1.0).min(0.90)
}

/// Implied win probability from an American price.
pub fn american_to_prob(price: f64) -> Option<f64> {
    if price >= 100.0 {
        Some(100.0 / (price + 100.0))
    } else if price <= -100.0 {
        let p = -price;
        Some(p / (p + 100.0))
    } else {
        None
    }
}

/// Expected-value gate: our probability must clear the implied market
/// probability by at least this much.
const EV_EDGE_THRESHOLD: f64 = 0.03;

pub fn ev_passes(model_prob: f64, market_price: Option<f64>) -> bool {
    match market_price.and_then(american_to_prob) {
        Some(implied) => model_prob - implied >= EV_EDGE_THRESHOLD,
        // No market price to compare against: no EV objection.
        None => true,
    }
}

pub fn impact(weight: f64, score: f64) -> f64 {
    weight * (score - 0.5)
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use chrono::{TimeZone, Utc};

    pub fn game(sport: Sport, provider_id: &str) -> Game {
        Game {
            id: Game::make_id(sport, provider_id),
            sport: sport.as_str().to_string(),
            provider_game_id: provider_id.to_string(),
            home_team: "Home Club".to_string(),
            away_team: "Away Club".to_string(),
            game_time_utc: Utc.with_ymd_and_hms(2026, 2, 27, 20, 0, 0).unwrap(),
            status: "scheduled".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn snapshot(game_id: &str) -> OddsSnapshot {
        OddsSnapshot {
            id: "snap-1".to_string(),
            game_id: game_id.to_string(),
            captured_at: Utc.with_ymd_and_hms(2026, 2, 27, 18, 0, 0).unwrap(),
            moneyline_home: Some(-150.0),
            moneyline_away: Some(130.0),
            total_line: Some(6.5),
            spread_home: Some(-1.5),
            spread_away: Some(1.5),
            raw: None,
            job_run_id: None,
        }
    }

    pub fn metrics(points_for: f64, points_against: f64, rest: i64, pace: Option<f64>) -> TeamMetrics {
        TeamMetrics {
            avg_points: Some(points_for),
            avg_points_allowed: Some(points_against),
            net_rating: Some(points_for - points_against),
            rest_days: Some(rest),
            form: "W-L-W-W-L".to_string(),
            pace,
            rank: Some(10),
            record: Some("30-20".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(weight: f64, score: f64) -> SubScore {
        SubScore {
            driver: "x".to_string(),
            weight,
            score,
            impact: impact(weight, score),
            status: DriverStatus::Ok,
        }
    }

    #[test]
    fn composite_rule_boundaries() {
        // weights below 1.0 pull toward neutral
        let parts = vec![part(0.4, 1.0), part(0.3, 0.5)];
        let sum = composite_score(&parts);
        assert!((sum - (0.4 + 0.15 + 0.15)).abs() < 1e-9);

        assert_eq!(composite_prediction(0.62), PredictionSide::Home);
        assert_eq!(composite_prediction(0.38), PredictionSide::Away);
        assert_eq!(composite_prediction(0.5), PredictionSide::Neutral);

        assert_eq!(composite_confidence(0.95), 0.85);
        assert_eq!(composite_confidence(0.30), 0.50);
        assert_eq!(composite_confidence(0.72), 0.72);
    }

    #[test]
    fn confidence_shapes() {
        assert!((directional_confidence(0.65) - 0.65).abs() < 1e-9);
        assert!((directional_confidence(0.35) - 0.65).abs() < 1e-9);
        assert_eq!(directional_confidence(1.0), 0.90);
        assert_eq!(magnitude_confidence(0.82), 0.82);
        assert_eq!(magnitude_confidence(1.5), 0.90);
    }

    #[test]
    fn american_odds_implied_probability() {
        let p = american_to_prob(-150.0).unwrap();
        assert!((p - 0.6).abs() < 1e-9);
        let p = american_to_prob(130.0).unwrap();
        assert!((p - 100.0 / 230.0).abs() < 1e-9);
        assert_eq!(american_to_prob(50.0), None);
    }

    #[test]
    fn ev_gate() {
        // -150 implies 0.60
        assert!(ev_passes(0.64, Some(-150.0)));
        assert!(!ev_passes(0.61, Some(-150.0)));
        assert!(ev_passes(0.40, None));
    }
}
