//! Form-driven drivers shared by the sports without bespoke models.

use crate::models::{BetType, DriverStatus, PredictionSide, Sport, Tier};

use super::{
    composite_confidence, composite_prediction, composite_score, directional_confidence,
    ev_passes, impact, DriverDescriptor, DriverGameContext, DriverInputs, Projection, SubScore,
};

const FORM_WEIGHT: f64 = 0.45;
const REST_WEIGHT: f64 = 0.25;

/// Net-rating points per unit of score, tuned to each sport's scoring scale.
fn net_rating_scale(sport: Sport) -> f64 {
    match sport {
        Sport::Ncaam => 0.02,
        Sport::Mlb => 0.12,
        Sport::Nfl => 0.03,
        Sport::Soccer | Sport::Fpl => 0.20,
        // bespoke models own these
        Sport::Nhl | Sport::Nba => 0.10,
    }
}

pub fn compute(sport: Sport, ctx: &DriverGameContext) -> Vec<DriverDescriptor> {
    let mut out = Vec::new();
    if let Some(card) = form_edge(sport, ctx) {
        out.push(card);
    }
    if let Some(card) = game_call(sport, ctx) {
        out.push(card);
    }
    out
}

fn form_edge(sport: Sport, ctx: &DriverGameContext) -> Option<DriverDescriptor> {
    let home_nr = ctx.home.net_rating?;
    let away_nr = ctx.away.net_rating?;

    let score = (0.5 + (home_nr - away_nr) * net_rating_scale(sport)).clamp(0.0, 1.0);
    if (score - 0.5).abs() < 0.06 {
        return None;
    }

    let prediction = if score > 0.5 {
        PredictionSide::Home
    } else {
        PredictionSide::Away
    };
    let confidence = directional_confidence(score);
    let model_prob = if prediction == PredictionSide::Home {
        score
    } else {
        1.0 - score
    };
    let price = match prediction {
        PredictionSide::Home => ctx.snapshot.moneyline_home,
        _ => ctx.snapshot.moneyline_away,
    };
    let side = if prediction == PredictionSide::Home {
        ctx.game.home_team.as_str()
    } else {
        ctx.game.away_team.as_str()
    };

    Some(DriverDescriptor {
        card_type: format!("{}-form-edge", sport.as_str()),
        card_title: "Form Edge".to_string(),
        driver_key: "form_edge".to_string(),
        prediction,
        confidence,
        tier: Tier::from_confidence(confidence),
        reasoning: format!(
            "{} outscores opponents by {:+.1} vs {:+.1} over the recent window",
            side, home_nr, away_nr
        ),
        driver_score: Some(score),
        driver_status: DriverStatus::Ok,
        driver_inputs: DriverInputs::FormEdge {
            home_net_rating: home_nr,
            away_net_rating: away_nr,
            home_form: ctx.home.form.clone(),
            away_form: ctx.away.form.clone(),
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

fn game_call(sport: Sport, ctx: &DriverGameContext) -> Option<DriverDescriptor> {
    let mut components = Vec::new();

    match (ctx.home.net_rating, ctx.away.net_rating) {
        (Some(hnr), Some(anr)) => {
            let score = (0.5 + (hnr - anr) * net_rating_scale(sport)).clamp(0.0, 1.0);
            components.push(sub("form_edge", FORM_WEIGHT, score, DriverStatus::Ok));
        }
        _ => components.push(sub("form_edge", FORM_WEIGHT, 0.5, DriverStatus::Skipped)),
    }

    match (ctx.home.rest_days, ctx.away.rest_days) {
        (Some(hr), Some(ar)) => {
            let score = (0.5 + (hr - ar).clamp(-3, 3) as f64 * 0.03).clamp(0.0, 1.0);
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
        card_type: format!("{}-game-call", sport.as_str()),
        card_title: "Game Call".to_string(),
        driver_key: format!("{}_game_composite", sport.as_str()),
        prediction,
        confidence,
        tier: Tier::from_confidence(confidence),
        reasoning: format!(
            "composite of form and rest signals leans {} at {:.2}",
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
