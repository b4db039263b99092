//! Bookmaker odds ingestion from The Odds API.
//!
//! Normalizes the aggregator's heterogeneous provider fields into one
//! canonical game+odds record per event. No store access here; the pull-odds
//! job owns persistence.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::models::Sport;

/// Canonical record produced for every event that survives field gating.
#[derive(Debug, Clone)]
pub struct CanonicalGame {
    pub provider_game_id: String,
    pub sport: Sport,
    pub home_team: String,
    pub away_team: String,
    pub game_time_utc: DateTime<Utc>,
    pub captured_at_utc: DateTime<Utc>,
    pub moneyline_home: Option<f64>,
    pub moneyline_away: Option<f64>,
    pub total_line: Option<f64>,
    pub spread_home: Option<f64>,
    pub spread_away: Option<f64>,
    pub raw: Value,
}

#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub games: Vec<CanonicalGame>,
    pub errors: Vec<String>,
    pub raw_count: usize,
    pub skipped_missing_fields: usize,
}

/// Bookmakers tried first when extracting a market, sharpest books first.
const BOOKMAKER_PRIORITY: [&str; 5] = ["pinnacle", "draftkings", "fanduel", "betmgm", "bet365"];

/// Provider field aliases in precedence order.
const ID_ALIASES: [&str; 3] = ["id", "event_id", "gameId"];
const HOME_ALIASES: [&str; 2] = ["home_team", "homeTeam"];
const AWAY_ALIASES: [&str; 2] = ["away_team", "awayTeam"];
const TIME_ALIASES: [&str; 3] = ["commence_time", "commence_time_utc", "start_time"];

pub struct OddsFetcher {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OddsFetcher {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.to_string(),
            base_url: "https://api.the-odds-api.com/v4".to_string(),
        }
    }

    /// One aggregator call for one sport: h2h + spreads + totals, american
    /// prices, gated and normalized.
    pub async fn fetch_sport(&self, sport: Sport, horizon_hours: i64) -> Result<FetchOutcome> {
        let url = format!(
            "{}/sports/{}/odds/?apiKey={}&regions=us&markets=h2h,spreads,totals&oddsFormat=american&dateFormat=iso",
            self.base_url,
            sport.odds_api_key(),
            self.api_key
        );

        let resp = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(20))
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 401 {
            return Err(anyhow::anyhow!("odds api: invalid API key (401)"));
        }
        if status.as_u16() == 422 {
            return Err(anyhow::anyhow!(
                "odds api: sport {} not in subscription (422)",
                sport.odds_api_key()
            ));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("odds api HTTP {}: {}", status, body));
        }

        let events: Vec<Value> = resp.json().await?;
        Ok(normalize_events(&events, sport, Utc::now(), horizon_hours))
    }
}

/// Pure normalization over the raw event array. Provider order is preserved;
/// identity de-dup is the store's job.
pub fn normalize_events(
    events: &[Value],
    sport: Sport,
    now: DateTime<Utc>,
    horizon_hours: i64,
) -> FetchOutcome {
    let mut outcome = FetchOutcome {
        raw_count: events.len(),
        ..Default::default()
    };
    let horizon_end = now + Duration::hours(horizon_hours);
    let horizon_start = now - Duration::hours(1);

    for event in events {
        let Some(game) = normalize_event(event, sport, now) else {
            outcome.skipped_missing_fields += 1;
            let id = first_string(event, &ID_ALIASES).unwrap_or_else(|| "<no id>".to_string());
            tracing::warn!(sport = %sport, event = %id, "odds event dropped: missing required fields");
            outcome.errors.push(format!("event {}: missing required fields", id));
            continue;
        };
        if game.game_time_utc < horizon_start || game.game_time_utc > horizon_end {
            continue;
        }
        outcome.games.push(game);
    }
    outcome
}

fn normalize_event(event: &Value, sport: Sport, now: DateTime<Utc>) -> Option<CanonicalGame> {
    let provider_game_id = first_string(event, &ID_ALIASES)?;
    let home_team = first_string(event, &HOME_ALIASES)?;
    let away_team = first_string(event, &AWAY_ALIASES)?;
    let game_time_utc = first_string(event, &TIME_ALIASES)
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))?;

    let (moneyline_home, moneyline_away) = extract_h2h(event, &home_team, &away_team);
    let total_line = extract_total(event);
    let (spread_home, spread_away) = extract_spreads(event, &home_team, &away_team);

    Some(CanonicalGame {
        provider_game_id,
        sport,
        home_team,
        away_team,
        game_time_utc,
        captured_at_utc: now,
        moneyline_home,
        moneyline_away,
        total_line,
        spread_home,
        spread_away,
        raw: event.clone(),
    })
}

fn first_string(event: &Value, aliases: &[&str]) -> Option<String> {
    for key in aliases {
        if let Some(s) = event.get(*key).and_then(|v| v.as_str()) {
            let s = s.trim();
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

/// Walk bookmakers in priority order and return the first one carrying the
/// requested market.
fn find_market<'a>(event: &'a Value, market_key: &str) -> Option<&'a Value> {
    let bookmakers = event.get("bookmakers")?.as_array()?;

    let market_of = |bk: &'a Value| -> Option<&'a Value> {
        bk.get("markets")?
            .as_array()?
            .iter()
            .find(|m| m.get("key").and_then(|k| k.as_str()) == Some(market_key))
    };

    for pref in &BOOKMAKER_PRIORITY {
        if let Some(bk) = bookmakers
            .iter()
            .find(|b| b.get("key").and_then(|k| k.as_str()) == Some(*pref))
        {
            if let Some(market) = market_of(bk) {
                return Some(market);
            }
        }
    }
    bookmakers.iter().find_map(market_of)
}

fn outcome_field(market: &Value, name: &str, field: &str) -> Option<f64> {
    market
        .get("outcomes")?
        .as_array()?
        .iter()
        .find(|o| o.get("name").and_then(|n| n.as_str()) == Some(name))
        .and_then(|o| o.get(field))
        .and_then(|p| p.as_f64())
}

fn extract_h2h(event: &Value, home: &str, away: &str) -> (Option<f64>, Option<f64>) {
    match find_market(event, "h2h") {
        Some(market) => (
            outcome_field(market, home, "price"),
            outcome_field(market, away, "price"),
        ),
        None => (None, None),
    }
}

fn extract_total(event: &Value) -> Option<f64> {
    let market = find_market(event, "totals")?;
    outcome_field(market, "Over", "point").or_else(|| outcome_field(market, "Under", "point"))
}

fn extract_spreads(event: &Value, home: &str, away: &str) -> (Option<f64>, Option<f64>) {
    match find_market(event, "spreads") {
        Some(market) => (
            outcome_field(market, home, "point"),
            outcome_field(market, away, "point"),
        ),
        None => (None, None),
    }
}
