//! Team-level reference statistics from the public ESPN site API.
//!
//! Lookups go through a fixed canonical-name table per sport with a fuzzy
//! fallback. Every failure path collapses to the neutral record so model runs
//! never fail on enrichment.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::models::Sport;

/// Recent-form metrics for one team. All-None with form "Unknown" is the
/// neutral record.
#[derive(Debug, Clone, Serialize)]
pub struct TeamMetrics {
    pub avg_points: Option<f64>,
    pub avg_points_allowed: Option<f64>,
    pub net_rating: Option<f64>,
    pub rest_days: Option<i64>,
    pub form: String,
    pub pace: Option<f64>,
    pub rank: Option<i64>,
    pub record: Option<String>,
}

impl TeamMetrics {
    pub fn neutral() -> Self {
        Self {
            avg_points: None,
            avg_points_allowed: None,
            net_rating: None,
            rest_days: None,
            form: "Unknown".to_string(),
            pace: None,
            rank: None,
            record: None,
        }
    }

    pub fn is_neutral(&self) -> bool {
        self.form == "Unknown" && self.avg_points.is_none()
    }
}

pub struct TeamMetricsClient {
    client: reqwest::Client,
    base_url: String,
    /// Inter-call pacing delay bounding QPS against the stats source.
    pace_delay_ms: u64,
}

impl TeamMetricsClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://site.api.espn.com/apis/site/v2/sports".to_string(),
            pace_delay_ms: 200,
        }
    }

    #[allow(dead_code)]
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            pace_delay_ms: 0,
        }
    }

    /// Infallible by contract: unknown team, transport failure, or an empty
    /// schedule all yield the neutral record.
    pub async fn metrics_for_team(&self, team_name: &str, sport: Sport) -> TeamMetrics {
        let Some(team_id) = resolve_team_id(team_name, sport) else {
            tracing::debug!(team = team_name, sport = %sport, "no canonical team mapping");
            return TeamMetrics::neutral();
        };

        match self.fetch_metrics(team_id, sport).await {
            Ok(metrics) => metrics,
            Err(e) => {
                tracing::warn!(team = team_name, sport = %sport, error = %e, "enrichment failed, using neutral record");
                TeamMetrics::neutral()
            }
        }
    }

    async fn fetch_metrics(&self, team_id: u32, sport: Sport) -> anyhow::Result<TeamMetrics> {
        tokio::time::sleep(std::time::Duration::from_millis(self.pace_delay_ms)).await;
        let schedule_url = format!(
            "{}/{}/teams/{}/schedule",
            self.base_url,
            sport.scoreboard_path(),
            team_id
        );
        let schedule: Value = self
            .client
            .get(&schedule_url)
            .timeout(std::time::Duration::from_secs(15))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        tokio::time::sleep(std::time::Duration::from_millis(self.pace_delay_ms)).await;
        let team_url = format!(
            "{}/{}/teams/{}",
            self.base_url,
            sport.scoreboard_path(),
            team_id
        );
        let team_info: Value = self
            .client
            .get(&team_url)
            .timeout(std::time::Duration::from_secs(15))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(metrics_from_responses(
            &schedule,
            &team_info,
            team_id,
            sport,
            Utc::now(),
        ))
    }
}

/// Compute the metrics record from the raw schedule + team-info responses.
/// Pure so the shape can be pinned down in tests.
pub fn metrics_from_responses(
    schedule: &Value,
    team_info: &Value,
    team_id: u32,
    sport: Sport,
    now: DateTime<Utc>,
) -> TeamMetrics {
    let mut completed: Vec<(DateTime<Utc>, f64, f64)> = Vec::new(); // (date, us, them)

    let events = schedule
        .get("events")
        .and_then(|e| e.as_array())
        .cloned()
        .unwrap_or_default();

    for event in &events {
        let Some(date) = event
            .get("date")
            .and_then(|d| d.as_str())
            .and_then(parse_event_date)
        else {
            continue;
        };
        if date > now {
            continue;
        }
        let Some(competitors) = event
            .get("competitions")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("competitors"))
            .and_then(|c| c.as_array())
        else {
            continue;
        };

        let mut ours = None;
        let mut theirs = None;
        for comp in competitors {
            let score = comp
                .get("score")
                .and_then(|s| s.get("value").and_then(|v| v.as_f64()).or_else(|| {
                    s.as_str().and_then(|raw| raw.parse::<f64>().ok())
                }));
            let Some(score) = score else { continue };
            let id_matches = comp
                .get("team")
                .and_then(|t| t.get("id"))
                .and_then(|i| i.as_str())
                .map(|i| i == team_id.to_string())
                .unwrap_or(false);
            if id_matches {
                ours = Some(score);
            } else {
                theirs = Some(score);
            }
        }
        if let (Some(us), Some(them)) = (ours, theirs) {
            completed.push((date, us, them));
        }
    }

    if completed.is_empty() {
        return TeamMetrics::neutral();
    }

    completed.sort_by_key(|(date, _, _)| *date);
    let recent: Vec<&(DateTime<Utc>, f64, f64)> = completed.iter().rev().take(10).collect();

    let games = recent.len() as f64;
    let avg_points = recent.iter().map(|(_, us, _)| us).sum::<f64>() / games;
    let avg_points_allowed = recent.iter().map(|(_, _, them)| them).sum::<f64>() / games;

    let form: Vec<&str> = recent
        .iter()
        .take(5)
        .map(|(_, us, them)| if us > them { "W" } else { "L" })
        .collect();

    let last_game = recent.first().map(|(date, _, _)| *date);
    let rest_days = last_game.map(|d| (now - d).num_days());

    // Pace proxy: combined scoring rate. Meaningless for hockey.
    let pace = match sport {
        Sport::Nhl => None,
        _ => Some(avg_points + avg_points_allowed),
    };

    let (rank, record) = rank_and_record(team_info);

    TeamMetrics {
        avg_points: Some(avg_points),
        avg_points_allowed: Some(avg_points_allowed),
        net_rating: Some(avg_points - avg_points_allowed),
        rest_days,
        form: form.join("-"),
        pace,
        rank,
        record,
    }
}

/// The source emits both full RFC-3339 instants and the short
/// `YYYY-MM-DDTHH:MMZ` form without seconds.
fn parse_event_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%MZ")
        .ok()
        .map(|naive| naive.and_utc())
}

fn rank_and_record(team_info: &Value) -> (Option<i64>, Option<String>) {
    let team = team_info.get("team").unwrap_or(team_info);
    let rank = team.get("rank").and_then(|r| r.as_i64());
    let record = team
        .get("record")
        .and_then(|r| r.get("items"))
        .and_then(|i| i.as_array())
        .and_then(|i| i.first())
        .and_then(|i| i.get("summary"))
        .and_then(|s| s.as_str())
        .map(String::from);
    (rank, record)
}

/// Canonical team-name table, case-insensitive with a partial-match and then
/// a similarity fallback.
pub fn resolve_team_id(team_name: &str, sport: Sport) -> Option<u32> {
    let table = team_table(sport);
    let needle = team_name.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }

    if let Some((_, id)) = table.iter().find(|(name, _)| name.to_lowercase() == needle) {
        return Some(*id);
    }

    if let Some((_, id)) = table.iter().find(|(name, _)| {
        let hay = name.to_lowercase();
        hay.contains(&needle) || needle.contains(&hay)
    }) {
        return Some(*id);
    }

    table
        .iter()
        .map(|(name, id)| (strsim::jaro_winkler(&name.to_lowercase(), &needle), *id))
        .filter(|(score, _)| *score >= 0.88)
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(_, id)| id)
}

fn team_table(sport: Sport) -> &'static [(&'static str, u32)] {
    match sport {
        Sport::Nhl => &[
            ("Anaheim Ducks", 25),
            ("Boston Bruins", 1),
            ("Buffalo Sabres", 2),
            ("Calgary Flames", 3),
            ("Carolina Hurricanes", 7),
            ("Chicago Blackhawks", 4),
            ("Colorado Avalanche", 17),
            ("Columbus Blue Jackets", 29),
            ("Dallas Stars", 9),
            ("Detroit Red Wings", 5),
            ("Edmonton Oilers", 6),
            ("Florida Panthers", 26),
            ("Los Angeles Kings", 8),
            ("Minnesota Wild", 30),
            ("Montreal Canadiens", 10),
            ("Nashville Predators", 27),
            ("New Jersey Devils", 11),
            ("New York Islanders", 12),
            ("New York Rangers", 13),
            ("Ottawa Senators", 14),
            ("Philadelphia Flyers", 15),
            ("Pittsburgh Penguins", 16),
            ("San Jose Sharks", 18),
            ("Seattle Kraken", 124292),
            ("St. Louis Blues", 19),
            ("Tampa Bay Lightning", 20),
            ("Toronto Maple Leafs", 21),
            ("Utah Hockey Club", 129764),
            ("Vancouver Canucks", 22),
            ("Vegas Golden Knights", 37),
            ("Washington Capitals", 23),
            ("Winnipeg Jets", 28),
        ],
        Sport::Nba => &[
            ("Atlanta Hawks", 1),
            ("Boston Celtics", 2),
            ("Brooklyn Nets", 17),
            ("Charlotte Hornets", 30),
            ("Chicago Bulls", 4),
            ("Cleveland Cavaliers", 5),
            ("Dallas Mavericks", 6),
            ("Denver Nuggets", 7),
            ("Detroit Pistons", 8),
            ("Golden State Warriors", 9),
            ("Houston Rockets", 10),
            ("Indiana Pacers", 11),
            ("LA Clippers", 12),
            ("Los Angeles Lakers", 13),
            ("Memphis Grizzlies", 29),
            ("Miami Heat", 14),
            ("Milwaukee Bucks", 15),
            ("Minnesota Timberwolves", 16),
            ("New Orleans Pelicans", 3),
            ("New York Knicks", 18),
            ("Oklahoma City Thunder", 25),
            ("Orlando Magic", 19),
            ("Philadelphia 76ers", 20),
            ("Phoenix Suns", 21),
            ("Portland Trail Blazers", 22),
            ("Sacramento Kings", 23),
            ("San Antonio Spurs", 24),
            ("Toronto Raptors", 28),
            ("Utah Jazz", 26),
            ("Washington Wizards", 27),
        ],
        Sport::Mlb => &[
            ("Arizona Diamondbacks", 29),
            ("Atlanta Braves", 15),
            ("Baltimore Orioles", 1),
            ("Boston Red Sox", 2),
            ("Chicago Cubs", 16),
            ("Chicago White Sox", 4),
            ("Cincinnati Reds", 17),
            ("Cleveland Guardians", 5),
            ("Colorado Rockies", 27),
            ("Detroit Tigers", 6),
            ("Houston Astros", 18),
            ("Kansas City Royals", 7),
            ("Los Angeles Angels", 3),
            ("Los Angeles Dodgers", 19),
            ("Miami Marlins", 28),
            ("Milwaukee Brewers", 8),
            ("Minnesota Twins", 9),
            ("New York Mets", 21),
            ("New York Yankees", 10),
            ("Oakland Athletics", 11),
            ("Philadelphia Phillies", 22),
            ("Pittsburgh Pirates", 23),
            ("San Diego Padres", 25),
            ("San Francisco Giants", 26),
            ("Seattle Mariners", 12),
            ("St. Louis Cardinals", 24),
            ("Tampa Bay Rays", 30),
            ("Texas Rangers", 13),
            ("Toronto Blue Jays", 14),
            ("Washington Nationals", 20),
        ],
        Sport::Nfl => &[
            ("Arizona Cardinals", 22),
            ("Atlanta Falcons", 1),
            ("Baltimore Ravens", 33),
            ("Buffalo Bills", 2),
            ("Carolina Panthers", 29),
            ("Chicago Bears", 3),
            ("Cincinnati Bengals", 4),
            ("Cleveland Browns", 5),
            ("Dallas Cowboys", 6),
            ("Denver Broncos", 7),
            ("Detroit Lions", 8),
            ("Green Bay Packers", 9),
            ("Houston Texans", 34),
            ("Indianapolis Colts", 11),
            ("Jacksonville Jaguars", 30),
            ("Kansas City Chiefs", 12),
            ("Las Vegas Raiders", 13),
            ("Los Angeles Chargers", 24),
            ("Los Angeles Rams", 14),
            ("Miami Dolphins", 15),
            ("Minnesota Vikings", 16),
            ("New England Patriots", 17),
            ("New Orleans Saints", 18),
            ("New York Giants", 19),
            ("New York Jets", 20),
            ("Philadelphia Eagles", 21),
            ("Pittsburgh Steelers", 23),
            ("San Francisco 49ers", 25),
            ("Seattle Seahawks", 26),
            ("Tampa Bay Buccaneers", 27),
            ("Tennessee Titans", 10),
            ("Washington Commanders", 28),
        ],
        Sport::Soccer | Sport::Fpl => &[
            ("Arsenal", 359),
            ("Aston Villa", 362),
            ("Bournemouth", 349),
            ("Brentford", 337),
            ("Brighton & Hove Albion", 331),
            ("Chelsea", 363),
            ("Crystal Palace", 384),
            ("Everton", 368),
            ("Fulham", 370),
            ("Liverpool", 364),
            ("Manchester City", 382),
            ("Manchester United", 360),
            ("Newcastle United", 361),
            ("Nottingham Forest", 393),
            ("Tottenham Hotspur", 367),
            ("West Ham United", 371),
            ("Wolverhampton Wanderers", 380),
        ],
        // College hoops has hundreds of programs; the table carries the
        // perennial top of the polls and fuzzy matching covers variants.
        Sport::Ncaam => &[
            ("Duke Blue Devils", 150),
            ("Kansas Jayhawks", 2305),
            ("Kentucky Wildcats", 96),
            ("North Carolina Tar Heels", 153),
            ("Gonzaga Bulldogs", 2250),
            ("Purdue Boilermakers", 2509),
            ("UConn Huskies", 41),
            ("Houston Cougars", 248),
            ("Arizona Wildcats", 12),
            ("Tennessee Volunteers", 2633),
            ("Auburn Tigers", 2),
            ("Alabama Crimson Tide", 333),
            ("Michigan State Spartans", 127),
            ("Iowa State Cyclones", 66),
            ("Marquette Golden Eagles", 269),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn resolves_exact_and_partial_names() {
        assert_eq!(resolve_team_id("Boston Bruins", Sport::Nhl), Some(1));
        assert_eq!(resolve_team_id("boston bruins", Sport::Nhl), Some(1));
        assert_eq!(resolve_team_id("Bruins", Sport::Nhl), Some(1));
        assert_eq!(resolve_team_id("Maple Leafs", Sport::Nhl), Some(21));
        assert_eq!(resolve_team_id("FC Nowhere", Sport::Nhl), None);
        assert_eq!(resolve_team_id("", Sport::Nhl), None);
    }

    fn schedule_fixture() -> Value {
        // two completed games for team 2, one future game
        json!({
            "events": [
                {
                    "date": "2026-02-20T00:00Z",
                    "competitions": [{"competitors": [
                        {"team": {"id": "2"}, "score": {"value": 110.0}},
                        {"team": {"id": "5"}, "score": {"value": 100.0}}
                    ]}]
                },
                {
                    "date": "2026-02-24T00:00Z",
                    "competitions": [{"competitors": [
                        {"team": {"id": "2"}, "score": {"value": 95.0}},
                        {"team": {"id": "9"}, "score": {"value": 105.0}}
                    ]}]
                },
                {
                    "date": "2026-03-01T00:00Z",
                    "competitions": [{"competitors": [
                        {"team": {"id": "2"}},
                        {"team": {"id": "4"}}
                    ]}]
                }
            ]
        })
    }

    #[test]
    fn computes_recent_form_metrics() {
        let now = Utc.with_ymd_and_hms(2026, 2, 27, 12, 0, 0).unwrap();
        let team_info = json!({"team": {"rank": 3, "record": {"items": [{"summary": "40-18"}]}}});

        let m = metrics_from_responses(&schedule_fixture(), &team_info, 2, Sport::Nba, now);
        assert_eq!(m.avg_points, Some(102.5));
        assert_eq!(m.avg_points_allowed, Some(102.5));
        assert_eq!(m.net_rating, Some(0.0));
        // most recent game first in the form string
        assert_eq!(m.form, "L-W");
        assert_eq!(m.rest_days, Some(3));
        assert_eq!(m.pace, Some(205.0));
        assert_eq!(m.rank, Some(3));
        assert_eq!(m.record.as_deref(), Some("40-18"));
    }

    #[test]
    fn hockey_has_no_pace() {
        let now = Utc.with_ymd_and_hms(2026, 2, 27, 12, 0, 0).unwrap();
        let m = metrics_from_responses(&schedule_fixture(), &json!({}), 2, Sport::Nhl, now);
        assert_eq!(m.pace, None);
        assert!(m.avg_points.is_some());
    }

    #[test]
    fn empty_schedule_is_neutral() {
        let now = Utc.with_ymd_and_hms(2026, 2, 27, 12, 0, 0).unwrap();
        let m = metrics_from_responses(&json!({"events": []}), &json!({}), 2, Sport::Nba, now);
        assert!(m.is_neutral());
        assert_eq!(m.form, "Unknown");
    }
}
