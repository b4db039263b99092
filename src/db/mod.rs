pub mod cards;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::str::FromStr;

use crate::models::{Game, JobStatus, OddsSnapshot, Sport};

pub async fn create_pool(database_path: &str) -> Result<SqlitePool> {
    if database_path == ":memory:" {
        // every pooled connection would otherwise get its own private database
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        return Ok(pool);
    }

    if let Some(parent) = std::path::Path::new(database_path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", database_path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

pub async fn init_database(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS games (
            id TEXT PRIMARY KEY,
            sport TEXT NOT NULL,
            provider_game_id TEXT NOT NULL,
            home_team TEXT NOT NULL,
            away_team TEXT NOT NULL,
            game_time_utc TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'scheduled',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (sport, provider_game_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS odds_snapshots (
            id TEXT PRIMARY KEY,
            game_id TEXT NOT NULL,
            captured_at TEXT NOT NULL,
            moneyline_home REAL,
            moneyline_away REAL,
            total_line REAL,
            spread_home REAL,
            spread_away REAL,
            raw TEXT,
            job_run_id TEXT,
            FOREIGN KEY (game_id) REFERENCES games (id),
            FOREIGN KEY (job_run_id) REFERENCES job_runs (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_runs (
            id TEXT PRIMARY KEY,
            job_name TEXT NOT NULL,
            job_key TEXT,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            error_message TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS model_outputs (
            id TEXT PRIMARY KEY,
            game_id TEXT NOT NULL,
            model_name TEXT NOT NULL,
            model_version TEXT NOT NULL,
            prediction_type TEXT NOT NULL,
            predicted_at TEXT NOT NULL,
            confidence REAL NOT NULL,
            output TEXT,
            odds_snapshot_id TEXT,
            job_run_id TEXT,
            FOREIGN KEY (game_id) REFERENCES games (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS card_payloads (
            id TEXT PRIMARY KEY,
            game_id TEXT NOT NULL,
            sport TEXT NOT NULL,
            card_type TEXT NOT NULL,
            card_title TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT,
            payload_data TEXT NOT NULL,
            model_output_ids TEXT NOT NULL,
            window_key TEXT,
            metadata TEXT,
            FOREIGN KEY (game_id) REFERENCES games (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS card_results (
            id TEXT PRIMARY KEY,
            card_id TEXT NOT NULL,
            game_id TEXT NOT NULL,
            sport TEXT NOT NULL,
            card_type TEXT NOT NULL,
            recommended_bet_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            result TEXT,
            settled_at TEXT,
            pnl_units REAL,
            metadata TEXT,
            FOREIGN KEY (card_id) REFERENCES card_payloads (id),
            FOREIGN KEY (game_id) REFERENCES games (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS game_results (
            game_id TEXT PRIMARY KEY,
            home_score INTEGER NOT NULL,
            away_score INTEGER NOT NULL,
            status TEXT NOT NULL,
            final_at TEXT NOT NULL,
            FOREIGN KEY (game_id) REFERENCES games (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracking_stats (
            sport TEXT PRIMARY KEY,
            wins INTEGER NOT NULL DEFAULT 0,
            losses INTEGER NOT NULL DEFAULT 0,
            pushes INTEGER NOT NULL DEFAULT 0,
            units REAL NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_odds_snapshots_game_captured ON odds_snapshots(game_id, captured_at)",
        "CREATE INDEX IF NOT EXISTS idx_games_time ON games(game_time_utc)",
        "CREATE INDEX IF NOT EXISTS idx_card_payloads_game_type ON card_payloads(game_id, card_type, created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_card_payloads_expires ON card_payloads(expires_at)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_card_results_card ON card_results(card_id)",
        "CREATE INDEX IF NOT EXISTS idx_card_results_status ON card_results(status)",
        "CREATE INDEX IF NOT EXISTS idx_job_runs_key ON job_runs(job_key)",
        "CREATE INDEX IF NOT EXISTS idx_job_runs_key_status ON job_runs(job_key, status)",
        // One card per (game, type) per scheduling window; keyless manual runs
        // are exempt.
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_card_payloads_window ON card_payloads(game_id, card_type, window_key) WHERE window_key IS NOT NULL",
    ];
    for sql in indexes {
        sqlx::query(sql).execute(pool).await?;
    }

    tracing::info!("Database initialized");
    Ok(())
}

// ── Game operations ───────────────────────────────────────────────────────────

/// Insert-or-update on the stable id. created_at is preserved; everything else
/// is last-write-wins. Executor-generic so a job can batch several upserts
/// into one transaction.
pub async fn upsert_game<'e, E>(executor: E, game: &Game) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO games
            (id, sport, provider_game_id, home_team, away_team, game_time_utc,
             status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            home_team     = excluded.home_team,
            away_team     = excluded.away_team,
            game_time_utc = excluded.game_time_utc,
            status        = excluded.status,
            updated_at    = excluded.updated_at
        "#,
    )
    .bind(&game.id)
    .bind(&game.sport)
    .bind(&game.provider_game_id)
    .bind(&game.home_team)
    .bind(&game.away_team)
    .bind(game.game_time_utc.to_rfc3339())
    .bind(&game.status)
    .bind(game.created_at.to_rfc3339())
    .bind(game.updated_at.to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_game(pool: &SqlitePool, game_id: &str) -> Result<Option<Game>> {
    let game = sqlx::query_as::<_, Game>("SELECT * FROM games WHERE id = ?")
        .bind(game_id)
        .fetch_optional(pool)
        .await?;
    Ok(game)
}

/// Games starting inside [from, to], optionally restricted to a sport set,
/// ordered by start time.
pub async fn games_in_window(
    pool: &SqlitePool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    sports: Option<&[Sport]>,
) -> Result<Vec<Game>> {
    let mut games = sqlx::query_as::<_, Game>(
        "SELECT * FROM games WHERE game_time_utc >= ? AND game_time_utc <= ? ORDER BY game_time_utc ASC",
    )
    .bind(from.to_rfc3339())
    .bind(to.to_rfc3339())
    .fetch_all(pool)
    .await?;

    if let Some(sports) = sports {
        let allowed: Vec<&str> = sports.iter().map(|s| s.as_str()).collect();
        games.retain(|g| allowed.contains(&g.sport.as_str()));
    }
    Ok(games)
}

pub async fn games_from(pool: &SqlitePool, from: DateTime<Utc>, limit: i64) -> Result<Vec<Game>> {
    let games = sqlx::query_as::<_, Game>(
        "SELECT * FROM games WHERE game_time_utc >= ? ORDER BY game_time_utc ASC LIMIT ?",
    )
    .bind(from.to_rfc3339())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(games)
}

/// Games whose start time is at least `min_hours` in the past and which have
/// no final result row yet. Settlement phase 1 feeds on this.
pub async fn games_awaiting_result(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    min_hours: i64,
    lookback_hours: i64,
) -> Result<Vec<Game>> {
    let newest = now - Duration::hours(min_hours);
    let oldest = now - Duration::hours(lookback_hours);
    let games = sqlx::query_as::<_, Game>(
        r#"
        SELECT g.* FROM games g
        LEFT JOIN game_results r ON r.game_id = g.id AND r.status = 'final'
        WHERE g.game_time_utc <= ? AND g.game_time_utc >= ? AND r.game_id IS NULL
        ORDER BY g.game_time_utc ASC
        "#,
    )
    .bind(newest.to_rfc3339())
    .bind(oldest.to_rfc3339())
    .fetch_all(pool)
    .await?;
    Ok(games)
}

// ── Odds snapshot operations ──────────────────────────────────────────────────

pub async fn insert_odds_snapshot<'e, E>(executor: E, snap: &OddsSnapshot) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO odds_snapshots
            (id, game_id, captured_at, moneyline_home, moneyline_away,
             total_line, spread_home, spread_away, raw, job_run_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&snap.id)
    .bind(&snap.game_id)
    .bind(snap.captured_at.to_rfc3339())
    .bind(snap.moneyline_home)
    .bind(snap.moneyline_away)
    .bind(snap.total_line)
    .bind(snap.spread_home)
    .bind(snap.spread_away)
    .bind(&snap.raw)
    .bind(&snap.job_run_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn latest_snapshot_for_game(
    pool: &SqlitePool,
    game_id: &str,
) -> Result<Option<OddsSnapshot>> {
    let snap = sqlx::query_as::<_, OddsSnapshot>(
        "SELECT * FROM odds_snapshots WHERE game_id = ? ORDER BY captured_at DESC LIMIT 1",
    )
    .bind(game_id)
    .fetch_optional(pool)
    .await?;
    Ok(snap)
}

/// Snapshots beyond the retention window are pruned, never mutated.
pub async fn prune_snapshots_before(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM odds_snapshots WHERE captured_at < ?")
        .bind(cutoff.to_rfc3339())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// ── Job run operations ────────────────────────────────────────────────────────

pub async fn insert_job_run(
    pool: &SqlitePool,
    job_name: &str,
    job_key: Option<&str>,
    started_at: DateTime<Utc>,
) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO job_runs (id, job_name, job_key, status, started_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(job_name)
    .bind(job_key)
    .bind(JobStatus::Running.as_str())
    .bind(started_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(id)
}

/// running -> success / failed transitions are terminal; the WHERE guard keeps
/// them that way.
pub async fn finish_job_run(
    pool: &SqlitePool,
    job_run_id: &str,
    status: JobStatus,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE job_runs SET status = ?, ended_at = ?, error_message = ? WHERE id = ? AND status = 'running'",
    )
    .bind(status.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(error_message)
    .bind(job_run_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Idempotency predicate: a job key may run unless a prior run with this key
/// succeeded or is still running. Failed runs permit retry.
pub async fn should_run_job_key(pool: &SqlitePool, job_key: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM job_runs WHERE job_key = ? AND status IN ('success', 'running')",
    )
    .bind(job_key)
    .fetch_one(pool)
    .await?;
    Ok(count == 0)
}

/// Any rows still marked running (stale after a crash or shutdown) are closed
/// out as failed so their keys become retryable.
pub async fn fail_stale_running_jobs(pool: &SqlitePool, reason: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE job_runs SET status = 'failed', ended_at = ?, error_message = ? WHERE status = 'running'",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(reason)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn get_job_run(pool: &SqlitePool, id: &str) -> Result<Option<crate::models::JobRun>> {
    let run = sqlx::query_as::<_, crate::models::JobRun>("SELECT * FROM job_runs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(run)
}

pub async fn count_job_runs_with_status(
    pool: &SqlitePool,
    job_key: &str,
    status: JobStatus,
) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM job_runs WHERE job_key = ? AND status = ?")
            .bind(job_key)
            .bind(status.as_str())
            .fetch_one(pool)
            .await?;
    Ok(count)
}

// ── Game result operations ────────────────────────────────────────────────────

pub async fn upsert_game_result(
    pool: &SqlitePool,
    game_id: &str,
    home_score: i64,
    away_score: i64,
    status: &str,
    final_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO game_results (game_id, home_score, away_score, status, final_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(game_id) DO UPDATE SET
            home_score = excluded.home_score,
            away_score = excluded.away_score,
            status     = excluded.status,
            final_at   = excluded.final_at
        "#,
    )
    .bind(game_id)
    .bind(home_score)
    .bind(away_score)
    .bind(status)
    .bind(final_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_game_result(
    pool: &SqlitePool,
    game_id: &str,
) -> Result<Option<crate::models::GameResult>> {
    let result = sqlx::query_as::<_, crate::models::GameResult>(
        "SELECT * FROM game_results WHERE game_id = ?",
    )
    .bind(game_id)
    .fetch_optional(pool)
    .await?;
    Ok(result)
}

/// Mark the game row itself final once a result lands.
pub async fn mark_game_final(pool: &SqlitePool, game_id: &str) -> Result<()> {
    sqlx::query("UPDATE games SET status = 'final', updated_at = ? WHERE id = ?")
        .bind(Utc::now().to_rfc3339())
        .bind(game_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> Result<i64> {
    // table names are compile-time constants at every call site
    let sql = format!("SELECT COUNT(*) FROM {}", table);
    let count: i64 = sqlx::query_scalar(&sql).fetch_one(pool).await?;
    Ok(count)
}

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = create_pool(":memory:").await.expect("memory pool");
    init_database(&pool).await.expect("schema");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_game(provider_id: &str, start: DateTime<Utc>) -> Game {
        Game {
            id: Game::make_id(Sport::Nhl, provider_id),
            sport: "nhl".to_string(),
            provider_game_id: provider_id.to_string(),
            home_team: "Boston Bruins".to_string(),
            away_team: "Toronto Maple Leafs".to_string(),
            game_time_utc: start,
            status: "scheduled".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_game_is_idempotent_on_id() {
        let pool = test_pool().await;
        let start = Utc.with_ymd_and_hms(2026, 2, 27, 20, 0, 0).unwrap();
        let game = sample_game("401559000", start);

        upsert_game(&pool, &game).await.unwrap();
        upsert_game(&pool, &game).await.unwrap();

        assert_eq!(count_rows(&pool, "games").await.unwrap(), 1);
        let stored = get_game(&pool, &game.id).await.unwrap().unwrap();
        assert_eq!(stored.id, "game-nhl-401559000");
        assert_eq!(stored.game_time_utc, start);
    }

    #[tokio::test]
    async fn job_key_idempotency_predicate() {
        let pool = test_pool().await;
        let key = "nhl|tminus|401559000|120";

        assert!(should_run_job_key(&pool, key).await.unwrap());

        let run_id = insert_job_run(&pool, "run_nhl_model", Some(key), Utc::now())
            .await
            .unwrap();
        // running blocks
        assert!(!should_run_job_key(&pool, key).await.unwrap());

        finish_job_run(&pool, &run_id, JobStatus::Failed, Some("boom"))
            .await
            .unwrap();
        // failed permits retry
        assert!(should_run_job_key(&pool, key).await.unwrap());

        let run_id = insert_job_run(&pool, "run_nhl_model", Some(key), Utc::now())
            .await
            .unwrap();
        finish_job_run(&pool, &run_id, JobStatus::Success, None)
            .await
            .unwrap();
        // success blocks forever
        assert!(!should_run_job_key(&pool, key).await.unwrap());
        // a different key is unaffected
        assert!(should_run_job_key(&pool, "nhl|tminus|401559000|30")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn finish_job_run_is_terminal() {
        let pool = test_pool().await;
        let run_id = insert_job_run(&pool, "pull_odds_hourly", None, Utc::now())
            .await
            .unwrap();
        finish_job_run(&pool, &run_id, JobStatus::Success, None)
            .await
            .unwrap();
        // second transition is a no-op
        finish_job_run(&pool, &run_id, JobStatus::Failed, Some("late"))
            .await
            .unwrap();
        let run = get_job_run(&pool, &run_id).await.unwrap().unwrap();
        assert_eq!(run.status, "success");
        assert!(run.error_message.is_none());
    }

    #[tokio::test]
    async fn snapshot_pruning_respects_cutoff() {
        let pool = test_pool().await;
        let start = Utc.with_ymd_and_hms(2026, 2, 27, 20, 0, 0).unwrap();
        let game = sample_game("401559001", start);
        upsert_game(&pool, &game).await.unwrap();

        let now = Utc::now();
        for age_minutes in [10i64, 150] {
            let snap = OddsSnapshot {
                id: uuid::Uuid::new_v4().to_string(),
                game_id: game.id.clone(),
                captured_at: now - Duration::minutes(age_minutes),
                moneyline_home: Some(-150.0),
                moneyline_away: Some(130.0),
                total_line: Some(6.5),
                spread_home: Some(-1.5),
                spread_away: Some(1.5),
                raw: None,
                job_run_id: None,
            };
            insert_odds_snapshot(&pool, &snap).await.unwrap();
        }

        let pruned = prune_snapshots_before(&pool, now - Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        let latest = latest_snapshot_for_game(&pool, &game.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.captured_at, now - Duration::minutes(10));
    }
}
