use std::collections::HashSet;
use std::env;

use chrono_tz::Tz;

use crate::models::Sport;

/// Process configuration, read once at startup and passed by reference into
/// the scheduler, the jobs, and the API. Nothing reads the environment after
/// this is constructed.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Scheduling timezone for hourly buckets and fixed daily windows.
    pub timezone: Tz,
    pub tick_ms: u64,
    pub dry_run: bool,
    /// When off, fixed daily windows are only due within two tick periods of
    /// their target, so a restart never replays yesterday's window.
    pub fixed_catchup: bool,
    pub enable_odds_pull: bool,
    pub enabled_sports: HashSet<Sport>,
    pub odds_api_key: String,
    pub database_path: String,
    pub server_port: u16,
    /// Horizon for odds fetches and model runs, hours ahead of now.
    pub horizon_hours: i64,
    /// Games must be at least this many hours past start before grading.
    pub min_hours_after_start: i64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let timezone = env::var("TZ")
            .ok()
            .and_then(|s| s.parse::<Tz>().ok())
            .unwrap_or(chrono_tz::America::New_York);

        let tick_ms = env::var("TICK_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60_000);

        let mut enabled_sports = HashSet::new();
        for sport in Sport::ALL {
            let var = format!("ENABLE_{}_MODEL", sport.as_str().to_uppercase());
            if env_flag(&var, true) {
                enabled_sports.insert(sport);
            }
        }

        let server_port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3000);

        Self {
            timezone,
            tick_ms,
            dry_run: env_flag("DRY_RUN", false),
            fixed_catchup: env_flag("FIXED_CATCHUP", true),
            enable_odds_pull: env_flag("ENABLE_ODDS_PULL", true),
            enabled_sports,
            odds_api_key: env::var("ODDS_API_KEY").unwrap_or_default(),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "data/cardforge.db".to_string()),
            server_port,
            horizon_hours: 36,
            min_hours_after_start: 3,
        }
    }

    pub fn sport_enabled(&self, sport: Sport) -> bool {
        self.enabled_sports.contains(&sport)
    }

    /// Config for tests: every sport enabled, dry-run off, ET windows.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            timezone: chrono_tz::America::New_York,
            tick_ms: 60_000,
            dry_run: false,
            fixed_catchup: true,
            enable_odds_pull: true,
            enabled_sports: Sport::ALL.into_iter().collect(),
            odds_api_key: String::new(),
            database_path: ":memory:".to_string(),
            server_port: 0,
            horizon_hours: 36,
            min_hours_after_start: 3,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
