//! Declarative payload schemas, one per card type.
//!
//! A schema is a flat rule list over dotted JSON paths: shape plus per-field
//! constraints. The card writer dispatches on the card type tag; an unknown
//! tag is a hard error upstream.

use serde_json::Value;

#[derive(Debug, Clone, Copy)]
pub enum Rule {
    NonEmptyString(&'static str),
    Number {
        path: &'static str,
        min: f64,
        max: f64,
    },
    Integer {
        path: &'static str,
        min: i64,
        max: i64,
    },
    Bool(&'static str),
    Object(&'static str),
    Array(&'static str),
    OneOf {
        path: &'static str,
        allowed: &'static [&'static str],
    },
}

pub struct CardSchema {
    pub version: u32,
    pub rules: Vec<Rule>,
}

const RECOMMENDATION_TYPES: &[&str] = &[
    "ML_HOME",
    "ML_AWAY",
    "SPREAD_HOME",
    "SPREAD_AWAY",
    "TOTAL_OVER",
    "TOTAL_UNDER",
    "PASS",
];

const DRIVER_STATUSES: &[&str] = &["ok", "degraded", "skipped"];

/// Envelope constraints shared by every card type.
fn base_rules() -> Vec<Rule> {
    vec![
        Rule::Integer {
            path: "schema_version",
            min: 1,
            max: 1,
        },
        Rule::NonEmptyString("game_id"),
        Rule::NonEmptyString("sport"),
        Rule::NonEmptyString("model_version"),
        Rule::NonEmptyString("home_team"),
        Rule::NonEmptyString("away_team"),
        Rule::NonEmptyString("matchup"),
        Rule::NonEmptyString("start_time_utc"),
        Rule::NonEmptyString("start_time_local"),
        Rule::NonEmptyString("timezone"),
        Rule::NonEmptyString("countdown"),
        Rule::OneOf {
            path: "recommendation.type",
            allowed: RECOMMENDATION_TYPES,
        },
        Rule::NonEmptyString("recommendation.text"),
        Rule::Object("projection"),
        Rule::Object("market"),
        Rule::Object("odds_context"),
        Rule::NonEmptyString("odds_context.captured_at"),
        Rule::Number {
            path: "confidence",
            min: 0.0,
            max: 1.0,
        },
        Rule::Integer {
            path: "confidence_pct",
            min: 0,
            max: 100,
        },
        Rule::Array("drivers_active"),
        Rule::NonEmptyString("reasoning"),
        Rule::Bool("ev_passed"),
        Rule::NonEmptyString("disclaimer"),
        Rule::NonEmptyString("generated_at"),
        Rule::NonEmptyString("driver.key"),
        Rule::OneOf {
            path: "driver.status",
            allowed: DRIVER_STATUSES,
        },
        Rule::Object("driver.inputs"),
        Rule::Array("driver_summary.weights"),
        Rule::NonEmptyString("driver_summary.impact_note"),
        Rule::Object("meta"),
        Rule::NonEmptyString("meta.inference_source"),
        Rule::Bool("meta.is_mock"),
    ]
}

fn with_base(mut extra: Vec<Rule>) -> Vec<Rule> {
    let mut rules = base_rules();
    rules.append(&mut extra);
    rules
}

/// The closed card-type set. Composite game calls share one shape; the leaf
/// drivers pin their discriminated inputs variant.
pub fn schema_for(card_type: &str) -> Option<CardSchema> {
    let rules = match card_type {
        "nhl-goalie" => with_base(vec![
            Rule::OneOf {
                path: "driver.inputs.kind",
                allowed: &["goalie_edge"],
            },
            Rule::Number {
                path: "driver.inputs.home_goals_against",
                min: 0.0,
                max: 15.0,
            },
            Rule::Number {
                path: "driver.inputs.away_goals_against",
                min: 0.0,
                max: 15.0,
            },
            Rule::OneOf {
                path: "prediction",
                allowed: &["HOME", "AWAY"],
            },
            Rule::OneOf {
                path: "recommended_bet_type",
                allowed: &["moneyline"],
            },
        ]),
        "nhl-pace-1p" => with_base(vec![
            Rule::OneOf {
                path: "driver.inputs.kind",
                allowed: &["first_period_pace"],
            },
            Rule::Number {
                path: "driver.inputs.expected_first_period_total",
                min: 0.0,
                max: 10.0,
            },
            Rule::Number {
                path: "driver.inputs.market_first_period_total",
                min: 0.0,
                max: 10.0,
            },
            Rule::OneOf {
                path: "prediction",
                allowed: &["OVER", "UNDER"],
            },
            Rule::OneOf {
                path: "recommended_bet_type",
                allowed: &["total"],
            },
        ]),
        "nba-pace-matchup" => with_base(vec![
            Rule::OneOf {
                path: "driver.inputs.kind",
                allowed: &["pace_matchup"],
            },
            Rule::Number {
                path: "driver.inputs.home_pace_percentile",
                min: 0.0,
                max: 100.0,
            },
            Rule::Number {
                path: "driver.inputs.away_pace_percentile",
                min: 0.0,
                max: 100.0,
            },
            Rule::OneOf {
                path: "driver.inputs.synergy",
                allowed: &["PACE_ALIGN_FAST", "PACE_ALIGN_SLOW"],
            },
            Rule::OneOf {
                path: "prediction",
                allowed: &["OVER", "UNDER"],
            },
            Rule::OneOf {
                path: "recommended_bet_type",
                allowed: &["total"],
            },
        ]),
        "nba-rest" => with_base(vec![
            Rule::OneOf {
                path: "driver.inputs.kind",
                allowed: &["rest_advantage"],
            },
            Rule::Integer {
                path: "driver.inputs.home_rest_days",
                min: 0,
                max: 60,
            },
            Rule::Integer {
                path: "driver.inputs.away_rest_days",
                min: 0,
                max: 60,
            },
            Rule::OneOf {
                path: "prediction",
                allowed: &["HOME", "AWAY"],
            },
            Rule::OneOf {
                path: "recommended_bet_type",
                allowed: &["spread"],
            },
        ]),
        t if t.ends_with("-form-edge") => with_base(vec![
            Rule::OneOf {
                path: "driver.inputs.kind",
                allowed: &["form_edge"],
            },
            Rule::NonEmptyString("driver.inputs.home_form"),
            Rule::NonEmptyString("driver.inputs.away_form"),
            Rule::OneOf {
                path: "prediction",
                allowed: &["HOME", "AWAY"],
            },
            Rule::OneOf {
                path: "recommended_bet_type",
                allowed: &["moneyline"],
            },
        ]),
        t if t.ends_with("-game-call") => with_base(vec![
            Rule::OneOf {
                path: "driver.inputs.kind",
                allowed: &["game_composite"],
            },
            Rule::Number {
                path: "driver.inputs.weighted_sum",
                min: 0.0,
                max: 1.0,
            },
            Rule::Array("driver.inputs.components"),
            Rule::OneOf {
                path: "prediction",
                allowed: &["HOME", "AWAY"],
            },
            Rule::OneOf {
                path: "recommended_bet_type",
                allowed: &["moneyline"],
            },
        ]),
        _ => return None,
    };

    // form-edge / game-call suffixes are only valid for known sports
    if let Some(sport) = card_type
        .strip_suffix("-form-edge")
        .or_else(|| card_type.strip_suffix("-game-call"))
    {
        crate::models::Sport::from_str_loose(sport)?;
    }

    Some(CardSchema { version: 1, rules })
}

/// Validate a payload against its card type's schema. Err carries the first
/// violation found.
pub fn validate(card_type: &str, payload: &Value) -> Result<(), String> {
    let Some(schema) = schema_for(card_type) else {
        return Err(format!("unknown card_type {}", card_type));
    };
    for rule in &schema.rules {
        check_rule(rule, payload)?;
    }
    Ok(())
}

fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn check_rule(rule: &Rule, payload: &Value) -> Result<(), String> {
    match rule {
        Rule::NonEmptyString(path) => match lookup(payload, path).and_then(|v| v.as_str()) {
            Some(s) if !s.trim().is_empty() => Ok(()),
            Some(_) => Err(format!("{}: empty string", path)),
            None => Err(format!("{}: expected string", path)),
        },
        Rule::Number { path, min, max } => match lookup(payload, path).and_then(|v| v.as_f64()) {
            Some(n) if n >= *min && n <= *max => Ok(()),
            Some(n) => Err(format!("{}: {} outside [{}, {}]", path, n, min, max)),
            None => Err(format!("{}: expected number", path)),
        },
        Rule::Integer { path, min, max } => match lookup(payload, path).and_then(|v| v.as_i64()) {
            Some(n) if n >= *min && n <= *max => Ok(()),
            Some(n) => Err(format!("{}: {} outside [{}, {}]", path, n, min, max)),
            None => Err(format!("{}: expected integer", path)),
        },
        Rule::Bool(path) => match lookup(payload, path).and_then(|v| v.as_bool()) {
            Some(_) => Ok(()),
            None => Err(format!("{}: expected boolean", path)),
        },
        Rule::Object(path) => match lookup(payload, path) {
            Some(v) if v.is_object() => Ok(()),
            _ => Err(format!("{}: expected object", path)),
        },
        Rule::Array(path) => match lookup(payload, path) {
            Some(v) if v.is_array() => Ok(()),
            _ => Err(format!("{}: expected array", path)),
        },
        Rule::OneOf { path, allowed } => match lookup(payload, path).and_then(|v| v.as_str()) {
            Some(s) if allowed.contains(&s) => Ok(()),
            Some(s) => Err(format!("{}: '{}' not in {:?}", path, s, allowed)),
            None => Err(format!("{}: expected one of {:?}", path, allowed)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_card_types_have_schemas() {
        for t in [
            "nhl-goalie",
            "nhl-pace-1p",
            "nhl-game-call",
            "nba-pace-matchup",
            "nba-rest",
            "nba-game-call",
            "ncaam-form-edge",
            "mlb-game-call",
            "nfl-form-edge",
            "soccer-game-call",
            "fpl-form-edge",
        ] {
            assert!(schema_for(t).is_some(), "missing schema for {}", t);
        }
        assert!(schema_for("nhl-zamboni").is_none());
        assert!(schema_for("cricket-game-call").is_none());
    }

    #[test]
    fn violations_name_the_offending_path() {
        let err = validate("nhl-goalie", &json!({"schema_version": 1})).unwrap_err();
        assert!(err.contains("game_id"));

        let err = check_rule(
            &Rule::Number {
                path: "confidence",
                min: 0.0,
                max: 1.0,
            },
            &json!({"confidence": 3.2}),
        )
        .unwrap_err();
        assert!(err.contains("confidence"));
        assert!(err.contains("3.2"));
    }

    #[test]
    fn one_of_rejects_wrong_variant() {
        let payload = json!({"driver": {"inputs": {"kind": "pace_matchup"}}});
        let rule = Rule::OneOf {
            path: "driver.inputs.kind",
            allowed: &["goalie_edge"],
        };
        assert!(check_rule(&rule, &payload).is_err());
    }

    #[test]
    fn dotted_lookup_walks_objects() {
        let payload = json!({"a": {"b": {"c": 7}}});
        assert_eq!(lookup(&payload, "a.b.c").unwrap().as_i64(), Some(7));
        assert!(lookup(&payload, "a.x.c").is_none());
    }
}
