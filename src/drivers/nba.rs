//! NBA drivers: pace matchup, rest advantage, and the composite game call.

use crate::models::{BetType, DriverStatus, PredictionSide, Tier};

use super::{
    composite_confidence, composite_prediction, composite_score, directional_confidence,
    ev_passes, impact, magnitude_confidence, DriverDescriptor, DriverGameContext, DriverInputs,
    Projection, SubScore,
};

/// League combined-scoring band used to place a team's pace on a 0..100
/// percentile scale.
const PACE_FLOOR: f64 = 205.0;
const PACE_CEILING: f64 = 245.0;

/// Pace-percentile gap at or beyond which the matchup styles clash and the
/// driver abstains.
const PACE_CLASH_GAP: f64 = 40.0;

const PACE_WEIGHT: f64 = 0.30;
const FORM_WEIGHT: f64 = 0.40;
const REST_WEIGHT: f64 = 0.20;

pub fn compute(ctx: &DriverGameContext) -> Vec<DriverDescriptor> {
    let mut out = Vec::new();
    if let Some(card) = pace_matchup(ctx) {
        out.push(card);
    }
    if let Some(card) = rest_advantage(ctx) {
        out.push(card);
    }
    if let Some(card) = game_call(ctx) {
        out.push(card);
    }
    out
}

pub fn pace_percentile(pace: f64) -> f64 {
    ((pace - PACE_FLOOR) / (PACE_CEILING - PACE_FLOOR) * 100.0).clamp(0.0, 100.0)
}

#[derive(Debug, PartialEq, Eq)]
pub enum PaceSynergy {
    AlignFast,
    AlignSlow,
    Clash,
    NoEdge,
}

pub fn classify_pace(home_pct: f64, away_pct: f64) -> PaceSynergy {
    if (home_pct - away_pct).abs() >= PACE_CLASH_GAP {
        return PaceSynergy::Clash;
    }
    if home_pct >= 60.0 && away_pct >= 60.0 {
        PaceSynergy::AlignFast
    } else if home_pct <= 40.0 && away_pct <= 40.0 {
        PaceSynergy::AlignSlow
    } else {
        PaceSynergy::NoEdge
    }
}

/// Two run-and-gun teams push the total; two grinders drag it. A style clash
/// is unreadable and produces nothing.
fn pace_matchup(ctx: &DriverGameContext) -> Option<DriverDescriptor> {
    let total_line = ctx.snapshot.total_line?;
    let home_pct = pace_percentile(ctx.home.pace?);
    let away_pct = pace_percentile(ctx.away.pace?);

    let synergy = classify_pace(home_pct, away_pct);
    let (prediction, synergy_name) = match synergy {
        PaceSynergy::AlignFast => (PredictionSide::Over, "PACE_ALIGN_FAST"),
        PaceSynergy::AlignSlow => (PredictionSide::Under, "PACE_ALIGN_SLOW"),
        PaceSynergy::Clash | PaceSynergy::NoEdge => return None,
    };

    // distance of the pair from the 50th percentile drives the score
    let pair_mean = (home_pct + away_pct) / 2.0;
    let score = (pair_mean / 100.0).clamp(0.0, 1.0);
    let confidence = magnitude_confidence(if prediction == PredictionSide::Over {
        score
    } else {
        1.0 - score
    });

    Some(DriverDescriptor {
        card_type: "nba-pace-matchup".to_string(),
        card_title: "Pace Matchup".to_string(),
        driver_key: "pace_synergy".to_string(),
        prediction,
        confidence,
        tier: Tier::from_confidence(confidence),
        reasoning: format!(
            "both teams sit at the {:.0}th/{:.0}th pace percentiles ({})",
            home_pct, away_pct, synergy_name
        ),
        driver_score: Some(score),
        driver_status: DriverStatus::Ok,
        driver_inputs: DriverInputs::PaceMatchup {
            home_pace_percentile: home_pct,
            away_pace_percentile: away_pct,
            synergy: synergy_name.to_string(),
            market_total: total_line,
        },
        recommended_bet_type: Some(BetType::Total),
        ev_threshold_passed: true,
        is_mock: false,
        driver_summary: Vec::new(),
        projection: Projection {
            total: Some(((ctx.home.pace? + ctx.away.pace?) / 2.0 * 10.0).round() / 10.0),
            ..Default::default()
        },
    })
}

/// Schedule-spot edge. A back-to-back against a rested side is the classic
/// fade.
fn rest_advantage(ctx: &DriverGameContext) -> Option<DriverDescriptor> {
    let home_rest = ctx.home.rest_days?;
    let away_rest = ctx.away.rest_days?;
    let diff = home_rest - away_rest;
    if diff.abs() < 2 && home_rest != 0 && away_rest != 0 {
        return None;
    }

    let mut score = 0.5 + diff.clamp(-3, 3) as f64 * 0.05;
    let back_to_back_side = if home_rest == 0 {
        score -= 0.05;
        Some("home".to_string())
    } else if away_rest == 0 {
        score += 0.05;
        Some("away".to_string())
    } else {
        None
    };
    let score = score.clamp(0.0, 1.0);
    if (score - 0.5).abs() < 0.05 {
        return None;
    }

    let prediction = if score > 0.5 {
        PredictionSide::Home
    } else {
        PredictionSide::Away
    };
    let confidence = directional_confidence(score);
    let rested = if prediction == PredictionSide::Home {
        ctx.game.home_team.as_str()
    } else {
        ctx.game.away_team.as_str()
    };

    Some(DriverDescriptor {
        card_type: "nba-rest".to_string(),
        card_title: "Rest Advantage".to_string(),
        driver_key: "rest_advantage".to_string(),
        prediction,
        confidence,
        tier: Tier::from_confidence(confidence),
        reasoning: format!(
            "{} holds the schedule spot: {} vs {} days of rest",
            rested, home_rest, away_rest
        ),
        driver_score: Some(score),
        driver_status: DriverStatus::Ok,
        driver_inputs: DriverInputs::RestAdvantage {
            home_rest_days: home_rest,
            away_rest_days: away_rest,
            back_to_back_side,
        },
        recommended_bet_type: Some(BetType::Spread),
        ev_threshold_passed: true,
        is_mock: false,
        driver_summary: Vec::new(),
        projection: Projection {
            margin_home: Some((score - 0.5) * 20.0),
            ..Default::default()
        },
    })
}

fn game_call(ctx: &DriverGameContext) -> Option<DriverDescriptor> {
    let mut components = Vec::new();

    match (ctx.home.pace, ctx.away.pace) {
        (Some(hp), Some(ap)) => {
            // a faster home team at home is a mild positive signal
            let score = (0.5 + (pace_percentile(hp) - pace_percentile(ap)) / 100.0 * 0.2)
                .clamp(0.0, 1.0);
            components.push(sub("pace_synergy", PACE_WEIGHT, score, DriverStatus::Ok));
        }
        _ => components.push(sub("pace_synergy", PACE_WEIGHT, 0.5, DriverStatus::Skipped)),
    }

    match (ctx.home.net_rating, ctx.away.net_rating) {
        (Some(hnr), Some(anr)) => {
            let score = (0.5 + (hnr - anr) * 0.02).clamp(0.0, 1.0);
            components.push(sub("form_edge", FORM_WEIGHT, score, DriverStatus::Ok));
        }
        _ => components.push(sub("form_edge", FORM_WEIGHT, 0.5, DriverStatus::Skipped)),
    }

    match (ctx.home.rest_days, ctx.away.rest_days) {
        (Some(hr), Some(ar)) => {
            let score = (0.5 + (hr - ar).clamp(-3, 3) as f64 * 0.04).clamp(0.0, 1.0);
            components.push(sub("rest_advantage", REST_WEIGHT, score, DriverStatus::Ok));
        }
        _ => components.push(sub("rest_advantage", REST_WEIGHT, 0.5, DriverStatus::Skipped)),
    }

    if components
        .iter()
        .all(|c| c.status == DriverStatus::Skipped)
    {
        return None;
    }

    let weighted_sum = composite_score(&components);
    let prediction = composite_prediction(weighted_sum);
    if prediction == PredictionSide::Neutral {
        return None;
    }
    let confidence = composite_confidence(weighted_sum);

    let model_prob = if prediction == PredictionSide::Home {
        weighted_sum
    } else {
        1.0 - weighted_sum
    };
    let price = match prediction {
        PredictionSide::Home => ctx.snapshot.moneyline_home,
        _ => ctx.snapshot.moneyline_away,
    };
    let degraded = components.iter().any(|c| c.status == DriverStatus::Skipped);
    let side = if prediction == PredictionSide::Home {
        ctx.game.home_team.as_str()
    } else {
        ctx.game.away_team.as_str()
    };

    Some(DriverDescriptor {
        card_type: "nba-game-call".to_string(),
        card_title: "Game Call".to_string(),
        driver_key: "nba_game_composite".to_string(),
        prediction,
        confidence,
        tier: Tier::from_confidence(confidence),
        reasoning: format!(
            "composite of pace, form and rest signals leans {} at {:.2}",
            side, weighted_sum
        ),
        driver_score: Some(weighted_sum),
        driver_status: if degraded {
            DriverStatus::Degraded
        } else {
            DriverStatus::Ok
        },
        driver_inputs: DriverInputs::GameComposite {
            weighted_sum,
            components: components.clone(),
        },
        recommended_bet_type: Some(BetType::Moneyline),
        ev_threshold_passed: ev_passes(model_prob, price),
        is_mock: false,
        driver_summary: components,
        projection: Projection {
            margin_home: Some((weighted_sum - 0.5) * 20.0),
            win_prob_home: Some(weighted_sum),
            ..Default::default()
        },
    })
}

fn sub(driver: &str, weight: f64, score: f64, status: DriverStatus) -> SubScore {
    SubScore {
        driver: driver.to_string(),
        weight,
        score,
        impact: impact(weight, score),
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::test_support::{game, metrics, snapshot};
    use crate::models::Sport;

    fn ctx_with_paces<'a>(
        g: &'a crate::models::Game,
        snap: &'a crate::models::OddsSnapshot,
        home: &'a crate::services::team_metrics::TeamMetrics,
        away: &'a crate::services::team_metrics::TeamMetrics,
    ) -> DriverGameContext<'a> {
        DriverGameContext {
            game: g,
            snapshot: snap,
            home,
            away,
        }
    }

    #[test]
    fn pace_percentile_scale() {
        assert_eq!(pace_percentile(205.0), 0.0);
        assert_eq!(pace_percentile(245.0), 100.0);
        assert_eq!(pace_percentile(225.0), 50.0);
        assert_eq!(pace_percentile(300.0), 100.0);
    }

    #[test]
    fn pace_clash_abstains() {
        // 95th vs 40th percentile: gap >= 40 points
        assert_eq!(classify_pace(95.0, 40.0), PaceSynergy::Clash);

        let g = game(Sport::Nba, "401700100");
        let snap = snapshot(&g.id);
        let home = metrics(120.0, 118.0, 2, Some(243.0)); // ~95th
        let away = metrics(108.0, 110.0, 2, Some(221.0)); // ~40th
        let cards = compute(&ctx_with_paces(&g, &snap, &home, &away));
        assert!(cards.iter().all(|c| c.card_type != "nba-pace-matchup"));
    }

    #[test]
    fn aligned_fast_teams_point_over() {
        let g = game(Sport::Nba, "401700101");
        let snap = snapshot(&g.id);
        let home = metrics(120.0, 116.0, 2, Some(238.0)); // ~82nd
        let away = metrics(118.0, 117.0, 2, Some(236.0)); // ~77th
        let cards = compute(&ctx_with_paces(&g, &snap, &home, &away));

        let pace = cards
            .iter()
            .find(|c| c.card_type == "nba-pace-matchup")
            .expect("pace card");
        assert_eq!(pace.prediction, PredictionSide::Over);
        assert_eq!(pace.recommended_bet_type, Some(BetType::Total));
        match &pace.driver_inputs {
            DriverInputs::PaceMatchup { synergy, .. } => {
                assert_eq!(synergy, "PACE_ALIGN_FAST")
            }
            other => panic!("unexpected inputs variant: {:?}", other),
        }
    }

    #[test]
    fn back_to_back_fade() {
        let g = game(Sport::Nba, "401700102");
        let snap = snapshot(&g.id);
        let home = metrics(115.0, 112.0, 3, Some(228.0));
        let away = metrics(113.0, 114.0, 0, Some(226.0)); // back-to-back
        let cards = compute(&ctx_with_paces(&g, &snap, &home, &away));

        let rest = cards
            .iter()
            .find(|c| c.card_type == "nba-rest")
            .expect("rest card");
        assert_eq!(rest.prediction, PredictionSide::Home);
        match &rest.driver_inputs {
            DriverInputs::RestAdvantage {
                back_to_back_side, ..
            } => assert_eq!(back_to_back_side.as_deref(), Some("away")),
            other => panic!("unexpected inputs variant: {:?}", other),
        }
    }

    #[test]
    fn level_rest_abstains() {
        let g = game(Sport::Nba, "401700103");
        let snap = snapshot(&g.id);
        let home = metrics(115.0, 112.0, 2, Some(228.0));
        let away = metrics(113.0, 114.0, 2, Some(226.0));
        let cards = compute(&ctx_with_paces(&g, &snap, &home, &away));
        assert!(cards.iter().all(|c| c.card_type != "nba-rest"));
    }
}
