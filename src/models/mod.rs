use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Sports the pipeline knows how to schedule and model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sport {
    Nhl,
    Nba,
    Ncaam,
    Mlb,
    Nfl,
    Soccer,
    Fpl,
}

impl Sport {
    pub const ALL: [Sport; 7] = [
        Sport::Nhl,
        Sport::Nba,
        Sport::Ncaam,
        Sport::Mlb,
        Sport::Nfl,
        Sport::Soccer,
        Sport::Fpl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sport::Nhl => "nhl",
            Sport::Nba => "nba",
            Sport::Ncaam => "ncaam",
            Sport::Mlb => "mlb",
            Sport::Nfl => "nfl",
            Sport::Soccer => "soccer",
            Sport::Fpl => "fpl",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Sport> {
        match s.trim().to_lowercase().as_str() {
            "nhl" => Some(Sport::Nhl),
            "nba" => Some(Sport::Nba),
            "ncaam" | "ncaab" => Some(Sport::Ncaam),
            "mlb" => Some(Sport::Mlb),
            "nfl" => Some(Sport::Nfl),
            "soccer" | "epl" => Some(Sport::Soccer),
            "fpl" => Some(Sport::Fpl),
            _ => None,
        }
    }

    /// Sport key understood by The Odds API.
    pub fn odds_api_key(&self) -> &'static str {
        match self {
            Sport::Nhl => "icehockey_nhl",
            Sport::Nba => "basketball_nba",
            Sport::Ncaam => "basketball_ncaab",
            Sport::Mlb => "baseball_mlb",
            Sport::Nfl => "americanfootball_nfl",
            Sport::Soccer => "soccer_epl",
            // FPL rides on the EPL fixture list; it has no odds feed of its own.
            Sport::Fpl => "soccer_epl",
        }
    }

    /// ESPN scoreboard path segment used by game grading.
    pub fn scoreboard_path(&self) -> &'static str {
        match self {
            Sport::Nhl => "hockey/nhl",
            Sport::Nba => "basketball/nba",
            Sport::Ncaam => "basketball/mens-college-basketball",
            Sport::Mlb => "baseball/mlb",
            Sport::Nfl => "football/nfl",
            Sport::Soccer => "soccer/eng.1",
            Sport::Fpl => "soccer/eng.1",
        }
    }
}

impl std::fmt::Display for Sport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Scheduled,
    InProgress,
    Final,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::Scheduled => "scheduled",
            GameStatus::InProgress => "in_progress",
            GameStatus::Final => "final",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }
}

/// Directional judgment a driver can make about a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PredictionSide {
    Home,
    Away,
    Over,
    Under,
    Neutral,
}

impl PredictionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionSide::Home => "HOME",
            PredictionSide::Away => "AWAY",
            PredictionSide::Over => "OVER",
            PredictionSide::Under => "UNDER",
            PredictionSide::Neutral => "NEUTRAL",
        }
    }
}

/// Coarse confidence bucket derived from the numeric confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    Super,
    Best,
    Watch,
}

impl Tier {
    /// confidence >= 0.75 -> SUPER, >= 0.70 -> BEST, >= 0.60 -> WATCH, else none.
    pub fn from_confidence(confidence: f64) -> Option<Tier> {
        if confidence >= 0.75 {
            Some(Tier::Super)
        } else if confidence >= 0.70 {
            Some(Tier::Best)
        } else if confidence >= 0.60 {
            Some(Tier::Watch)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Super => "SUPER",
            Tier::Best => "BEST",
            Tier::Watch => "WATCH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Ok,
    Degraded,
    Skipped,
}

impl DriverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverStatus::Ok => "ok",
            DriverStatus::Degraded => "degraded",
            DriverStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetType {
    Moneyline,
    Spread,
    Total,
}

impl BetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetType::Moneyline => "moneyline",
            BetType::Spread => "spread",
            BetType::Total => "total",
        }
    }

    pub fn from_db(s: &str) -> Option<BetType> {
        match s {
            "moneyline" => Some(BetType::Moneyline),
            "spread" => Some(BetType::Spread),
            "total" => Some(BetType::Total),
            _ => None,
        }
    }
}

/// Concrete recommendation carried in the card payload and settled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationType {
    MlHome,
    MlAway,
    SpreadHome,
    SpreadAway,
    TotalOver,
    TotalUnder,
    Pass,
}

impl RecommendationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationType::MlHome => "ML_HOME",
            RecommendationType::MlAway => "ML_AWAY",
            RecommendationType::SpreadHome => "SPREAD_HOME",
            RecommendationType::SpreadAway => "SPREAD_AWAY",
            RecommendationType::TotalOver => "TOTAL_OVER",
            RecommendationType::TotalUnder => "TOTAL_UNDER",
            RecommendationType::Pass => "PASS",
        }
    }

    pub fn bet_type(&self) -> Option<BetType> {
        match self {
            RecommendationType::MlHome | RecommendationType::MlAway => Some(BetType::Moneyline),
            RecommendationType::SpreadHome | RecommendationType::SpreadAway => {
                Some(BetType::Spread)
            }
            RecommendationType::TotalOver | RecommendationType::TotalUnder => Some(BetType::Total),
            RecommendationType::Pass => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettleOutcome {
    Win,
    Loss,
    Push,
    Void,
}

impl SettleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettleOutcome::Win => "win",
            SettleOutcome::Loss => "loss",
            SettleOutcome::Push => "push",
            SettleOutcome::Void => "void",
        }
    }
}

// ── Store entities ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Game {
    pub id: String,
    pub sport: String,
    pub provider_game_id: String,
    pub home_team: String,
    pub away_team: String,
    pub game_time_utc: DateTime<Utc>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Game {
    /// Stable external key: two ingests of identical provider payloads must
    /// yield identical ids.
    pub fn make_id(sport: Sport, provider_game_id: &str) -> String {
        format!("game-{}-{}", sport.as_str(), provider_game_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OddsSnapshot {
    pub id: String,
    pub game_id: String,
    pub captured_at: DateTime<Utc>,
    pub moneyline_home: Option<f64>,
    pub moneyline_away: Option<f64>,
    pub total_line: Option<f64>,
    pub spread_home: Option<f64>,
    pub spread_away: Option<f64>,
    pub raw: Option<String>,
    pub job_run_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobRun {
    pub id: String,
    pub job_name: String,
    pub job_key: Option<String>,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ModelOutput {
    pub id: String,
    pub game_id: String,
    pub model_name: String,
    pub model_version: String,
    pub prediction_type: String,
    pub predicted_at: DateTime<Utc>,
    pub confidence: f64,
    pub output: Option<String>,
    pub odds_snapshot_id: Option<String>,
    pub job_run_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CardPayload {
    pub id: String,
    pub game_id: String,
    pub sport: String,
    pub card_type: String,
    pub card_title: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub payload_data: String,
    pub model_output_ids: String,
    pub window_key: Option<String>,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CardResult {
    pub id: String,
    pub card_id: String,
    pub game_id: String,
    pub sport: String,
    pub card_type: String,
    pub recommended_bet_type: String,
    pub status: String,
    pub result: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
    pub pnl_units: Option<f64>,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GameResult {
    pub game_id: String,
    pub home_score: i64,
    pub away_score: i64,
    pub status: String,
    pub final_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TrackingStats {
    pub sport: String,
    pub wins: i64,
    pub losses: i64,
    pub pushes: i64,
    pub units: f64,
    pub updated_at: DateTime<Utc>,
}

// ── API response envelope ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_thresholds() {
        assert_eq!(Tier::from_confidence(0.80), Some(Tier::Super));
        assert_eq!(Tier::from_confidence(0.75), Some(Tier::Super));
        assert_eq!(Tier::from_confidence(0.72), Some(Tier::Best));
        assert_eq!(Tier::from_confidence(0.70), Some(Tier::Best));
        assert_eq!(Tier::from_confidence(0.65), Some(Tier::Watch));
        assert_eq!(Tier::from_confidence(0.60), Some(Tier::Watch));
        assert_eq!(Tier::from_confidence(0.59), None);
    }

    #[test]
    fn stable_game_ids() {
        let a = Game::make_id(Sport::Nhl, "401559000");
        let b = Game::make_id(Sport::Nhl, "401559000");
        assert_eq!(a, b);
        assert_eq!(a, "game-nhl-401559000");
        assert_ne!(a, Game::make_id(Sport::Nba, "401559000"));
    }

    #[test]
    fn recommendation_bet_types() {
        assert_eq!(
            RecommendationType::MlHome.bet_type(),
            Some(BetType::Moneyline)
        );
        assert_eq!(
            RecommendationType::SpreadAway.bet_type(),
            Some(BetType::Spread)
        );
        assert_eq!(
            RecommendationType::TotalUnder.bet_type(),
            Some(BetType::Total)
        );
        assert_eq!(RecommendationType::Pass.bet_type(), None);
    }

    #[test]
    fn sport_round_trip() {
        for sport in Sport::ALL {
            assert_eq!(Sport::from_str_loose(sport.as_str()), Some(sport));
        }
        assert_eq!(Sport::from_str_loose("NCAAB"), Some(Sport::Ncaam));
        assert_eq!(Sport::from_str_loose("curling"), None);
    }
}
