//! NHL drivers: goalie edge, first-period pace, and the composite game call.

use crate::models::{BetType, DriverStatus, PredictionSide, Tier};

use super::{
    composite_confidence, composite_prediction, composite_score, directional_confidence,
    ev_passes, impact, DriverDescriptor, DriverGameContext, DriverInputs, Projection, SubScore,
};

const GOALIE_WEIGHT: f64 = 0.35;
const FORM_WEIGHT: f64 = 0.35;
const REST_WEIGHT: f64 = 0.20;

pub fn compute(ctx: &DriverGameContext) -> Vec<DriverDescriptor> {
    let mut out = Vec::new();
    if let Some(card) = goalie_edge(ctx) {
        out.push(card);
    }
    if let Some(card) = first_period_pace(ctx) {
        out.push(card);
    }
    if let Some(card) = game_call(ctx) {
        out.push(card);
    }
    out
}

/// Goals-against differential with a rest nudge. Hockey's pace proxy is
/// meaningless, so this is the sport's sharpest single signal.
fn goalie_edge(ctx: &DriverGameContext) -> Option<DriverDescriptor> {
    let home_ga = ctx.home.avg_points_allowed?;
    let away_ga = ctx.away.avg_points_allowed?;

    let mut score = 0.5 + (away_ga - home_ga) * 0.08;
    let mut status = DriverStatus::Ok;
    match (ctx.home.rest_days, ctx.away.rest_days) {
        (Some(hr), Some(ar)) => {
            score += (hr - ar).clamp(-2, 2) as f64 * 0.02;
        }
        _ => status = DriverStatus::Degraded,
    }
    let score = score.clamp(0.0, 1.0);

    // deadband: no edge, no card
    if (score - 0.5).abs() < 0.05 {
        return None;
    }

    let prediction = if score > 0.5 {
        PredictionSide::Home
    } else {
        PredictionSide::Away
    };
    let confidence = directional_confidence(score);
    let price = match prediction {
        PredictionSide::Home => ctx.snapshot.moneyline_home,
        _ => ctx.snapshot.moneyline_away,
    };
    let model_prob = if prediction == PredictionSide::Home {
        score
    } else {
        1.0 - score
    };

    let (favored, favored_ga, other_ga) = if prediction == PredictionSide::Home {
        (ctx.game.home_team.as_str(), home_ga, away_ga)
    } else {
        (ctx.game.away_team.as_str(), away_ga, home_ga)
    };

    Some(DriverDescriptor {
        card_type: "nhl-goalie".to_string(),
        card_title: "Goalie Edge".to_string(),
        driver_key: "goalie_edge".to_string(),
        prediction,
        confidence,
        tier: Tier::from_confidence(confidence),
        reasoning: format!(
            "{} concedes {:.2} goals per game vs {:.2} for the opposition",
            favored, favored_ga, other_ga
        ),
        driver_score: Some(score),
        driver_status: status,
        driver_inputs: DriverInputs::GoalieEdge {
            home_goals_against: home_ga,
            away_goals_against: away_ga,
            home_rest_days: ctx.home.rest_days,
            away_rest_days: ctx.away.rest_days,
        },
        recommended_bet_type: Some(BetType::Moneyline),
        ev_threshold_passed: ev_passes(model_prob, price),
        is_mock: false,
        driver_summary: Vec::new(),
        projection: Projection {
            win_prob_home: Some(score),
            ..Default::default()
        },
    })
}

/// First-period total lean from combined scoring rates against one third of
/// the full-game line.
fn first_period_pace(ctx: &DriverGameContext) -> Option<DriverDescriptor> {
    let total_line = ctx.snapshot.total_line?;
    let home_gf = ctx.home.avg_points?;
    let away_gf = ctx.away.avg_points?;
    let home_ga = ctx.home.avg_points_allowed?;
    let away_ga = ctx.away.avg_points_allowed?;

    let expected_total = (home_gf + away_ga) / 2.0 + (away_gf + home_ga) / 2.0;
    let expected_1p = expected_total / 3.0;
    let market_1p = total_line / 3.0;

    let ratio = expected_1p / market_1p;
    let (prediction, score) = if ratio >= 1.08 {
        (PredictionSide::Over, (0.5 + (ratio - 1.0)).min(1.0))
    } else if ratio <= 0.92 {
        (PredictionSide::Under, (0.5 + (1.0 - ratio)).min(1.0))
    } else {
        return None;
    };

    let confidence = directional_confidence(score);
    Some(DriverDescriptor {
        card_type: "nhl-pace-1p".to_string(),
        card_title: "First Period Pace".to_string(),
        driver_key: "pace_1p".to_string(),
        prediction,
        confidence,
        tier: Tier::from_confidence(confidence),
        reasoning: format!(
            "projected first period at {:.2} goals against a market {:.2}",
            expected_1p, market_1p
        ),
        driver_score: Some(score),
        driver_status: DriverStatus::Ok,
        driver_inputs: DriverInputs::FirstPeriodPace {
            expected_first_period_total: expected_1p,
            market_first_period_total: market_1p,
            combined_scoring_rate: expected_total,
        },
        recommended_bet_type: Some(BetType::Total),
        ev_threshold_passed: true,
        is_mock: false,
        driver_summary: Vec::new(),
        projection: Projection {
            total: Some(expected_total),
            ..Default::default()
        },
    })
}

/// Composite game call over goalie, form, and rest sub-scores.
fn game_call(ctx: &DriverGameContext) -> Option<DriverDescriptor> {
    let mut components = Vec::new();

    match (ctx.home.avg_points_allowed, ctx.away.avg_points_allowed) {
        (Some(hga), Some(aga)) => {
            let score = (0.5 + (aga - hga) * 0.08).clamp(0.0, 1.0);
            components.push(sub("goalie_edge", GOALIE_WEIGHT, score, DriverStatus::Ok));
        }
        _ => components.push(sub("goalie_edge", GOALIE_WEIGHT, 0.5, DriverStatus::Skipped)),
    }

    match (ctx.home.net_rating, ctx.away.net_rating) {
        (Some(hnr), Some(anr)) => {
            let score = (0.5 + (hnr - anr) * 0.10).clamp(0.0, 1.0);
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
        card_type: "nhl-game-call".to_string(),
        card_title: "Game Call".to_string(),
        driver_key: "nhl_game_composite".to_string(),
        prediction,
        confidence,
        tier: Tier::from_confidence(confidence),
        reasoning: format!(
            "composite of goalie, form and rest signals leans {} at {:.2}",
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
            margin_home: Some((weighted_sum - 0.5) * 4.0),
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
