//! The tick-loop dispatcher.
//!
//! Each tick computes the due job keys from three window families (hourly
//! odds bucket, fixed daily local-time windows per sport, per-game T-minus
//! bands), gates them through the job_runs idempotency predicate, and
//! dispatches sequentially. All idempotency state lives in the store; the
//! scheduler itself is stateless across restarts.

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::db;
use crate::jobs::{self, JobContext, JobOptions};
use crate::models::Sport;

/// T-minus targets in minutes before game start, widest first.
pub const TMINUS_BANDS: [i64; 4] = [120, 90, 60, 30];

/// Closed tolerance below each T-minus target: due iff minutes-to-start is in
/// [target - TOLERANCE, target].
pub const TMINUS_TOLERANCE_MINUTES: i64 = 5;

/// Fixed daily windows in the scheduling timezone.
pub const FIXED_WINDOWS: [(u32, u32); 2] = [(9, 0), (12, 0)];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    PullOdds,
    RunModel(Sport),
    Settle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueJob {
    pub key: String,
    pub kind: JobKind,
}

pub struct Scheduler {
    ctx: JobContext,
}

impl Scheduler {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    /// Run the loop until cancelled. Ticks never overlap: the tick body is
    /// awaited before the interval is polled again, and a long tick delays
    /// the next one rather than stacking.
    pub async fn run(&self) {
        let period = std::time::Duration::from_millis(self.ctx.config.tick_ms);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            tick_ms = self.ctx.config.tick_ms,
            timezone = %self.ctx.config.timezone,
            dry_run = self.ctx.config.dry_run,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => {
                    tracing::info!("scheduler stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick_once(Utc::now()).await {
                        tracing::error!(error = %e, "tick failed");
                    }
                }
            }
        }
    }

    /// One tick: compute candidates, gate, dispatch. Job failures are logged
    /// and never stop the loop.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let candidates = self.due_candidates(now).await?;
        let eligible = self.gate_candidates(candidates).await?;

        let mut dispatched = 0usize;
        for due in eligible {
            if self.ctx.cancel.is_cancelled() {
                break;
            }
            if self.ctx.config.dry_run {
                tracing::info!(job_key = due.key, "dry run: would dispatch");
                continue;
            }
            match self.dispatch(&due).await {
                Ok(report) => {
                    dispatched += 1;
                    tracing::debug!(job_key = due.key, skipped = report.skipped, "dispatched");
                }
                Err(e) => {
                    tracing::error!(job_key = due.key, error = %e, "job dispatch failed");
                }
            }
        }
        Ok(dispatched)
    }

    /// Window computation for one instant, de-duplicated by key within the
    /// tick. Pure apart from the upcoming-games read.
    pub async fn due_candidates(&self, now: DateTime<Utc>) -> Result<Vec<DueJob>> {
        let config = &self.ctx.config;
        let mut due: Vec<DueJob> = Vec::new();

        if config.enable_odds_pull {
            due.push(DueJob {
                key: hourly_odds_key(now, config.timezone),
                kind: JobKind::PullOdds,
            });
        }
        due.push(DueJob {
            key: hourly_settle_key(now, config.timezone),
            kind: JobKind::Settle,
        });

        let enabled: Vec<Sport> = Sport::ALL
            .into_iter()
            .filter(|s| config.sport_enabled(*s))
            .collect();

        for sport in &enabled {
            for key in due_fixed_windows(
                *sport,
                now,
                config.timezone,
                config.fixed_catchup,
                config.tick_ms,
            ) {
                due.push(DueJob {
                    key,
                    kind: JobKind::RunModel(*sport),
                });
            }
        }

        let games = db::games_in_window(
            &self.ctx.pool,
            now - Duration::hours(1),
            now + Duration::hours(config.horizon_hours),
            Some(&enabled),
        )
        .await?;

        for game in &games {
            let Some(sport) = Sport::from_str_loose(&game.sport) else {
                continue;
            };
            for target in due_tminus_bands(now, game.game_time_utc) {
                due.push(DueJob {
                    key: tminus_key(sport, &game.provider_game_id, target),
                    kind: JobKind::RunModel(sport),
                });
            }
        }

        // de-duplicate by key within the tick, first occurrence wins
        let mut seen = std::collections::HashSet::new();
        due.retain(|d| seen.insert(d.key.clone()));
        Ok(due)
    }

    /// Apply the idempotency predicate to each candidate.
    pub async fn gate_candidates(&self, candidates: Vec<DueJob>) -> Result<Vec<DueJob>> {
        let mut eligible = Vec::new();
        for candidate in candidates {
            if db::should_run_job_key(&self.ctx.pool, &candidate.key).await? {
                eligible.push(candidate);
            } else {
                tracing::debug!(job_key = candidate.key, "window already satisfied");
            }
        }
        Ok(eligible)
    }

    async fn dispatch(&self, due: &DueJob) -> Result<jobs::JobReport> {
        let opts = JobOptions {
            job_key: Some(due.key.clone()),
            dry_run: false,
        };
        match &due.kind {
            JobKind::PullOdds => jobs::pull_odds::run(&self.ctx, &opts).await,
            JobKind::RunModel(sport) => jobs::run_model::run(&self.ctx, *sport, &opts).await,
            JobKind::Settle => jobs::settle::run(&self.ctx, &opts).await,
        }
    }
}

// ── Window keys ───────────────────────────────────────────────────────────────

/// `odds|hourly|YYYY-MM-DD|HH` in the scheduling timezone.
pub fn hourly_odds_key(now: DateTime<Utc>, tz: Tz) -> String {
    let local = now.with_timezone(&tz);
    format!(
        "odds|hourly|{:04}-{:02}-{:02}|{:02}",
        local.year(),
        local.month(),
        local.day(),
        local.hour()
    )
}

/// Settlement rides the same hourly bucket under its own key family.
pub fn hourly_settle_key(now: DateTime<Utc>, tz: Tz) -> String {
    let local = now.with_timezone(&tz);
    format!(
        "settle|hourly|{:04}-{:02}-{:02}|{:02}",
        local.year(),
        local.month(),
        local.day(),
        local.hour()
    )
}

pub fn fixed_key(sport: Sport, now_local_date: (i32, u32, u32), hour: u32, minute: u32) -> String {
    format!(
        "{}|fixed|{:04}-{:02}-{:02}|{:02}{:02}",
        sport.as_str(),
        now_local_date.0,
        now_local_date.1,
        now_local_date.2,
        hour,
        minute
    )
}

pub fn tminus_key(sport: Sport, provider_game_id: &str, target_minutes: i64) -> String {
    format!(
        "{}|tminus|{}|{}",
        sport.as_str(),
        provider_game_id,
        target_minutes
    )
}

/// Fixed daily windows due at this instant. Due iff the target's calendar
/// date equals the current local date and now is at or past the target; with
/// catch-up off, only within two tick periods of the target.
pub fn due_fixed_windows(
    sport: Sport,
    now: DateTime<Utc>,
    tz: Tz,
    fixed_catchup: bool,
    tick_ms: u64,
) -> Vec<String> {
    let local = now.with_timezone(&tz);
    let mut due = Vec::new();

    for (hour, minute) in FIXED_WINDOWS {
        let Some(target) = tz
            .with_ymd_and_hms(local.year(), local.month(), local.day(), hour, minute, 0)
            .earliest()
        else {
            continue;
        };
        if now < target {
            continue;
        }
        if !fixed_catchup {
            let elapsed_ms = (now - target.with_timezone(&Utc)).num_milliseconds();
            if elapsed_ms > 2 * tick_ms as i64 {
                continue;
            }
        }
        due.push(fixed_key(
            sport,
            (local.year(), local.month(), local.day()),
            hour,
            minute,
        ));
    }
    due
}

/// T-minus bands due at this instant for one game start. A band is due iff
/// whole minutes-to-start lies in the closed interval [target - 5, target].
pub fn due_tminus_bands(now: DateTime<Utc>, game_time_utc: DateTime<Utc>) -> Vec<i64> {
    let minutes_until = (game_time_utc - now).num_minutes();
    TMINUS_BANDS
        .into_iter()
        .filter(|target| {
            minutes_until >= target - TMINUS_TOLERANCE_MINUTES && minutes_until <= *target
        })
        .collect()
}
