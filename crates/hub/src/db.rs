use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::phase::PhaseParameters;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// One cultivation run. The newest row is "the" cycle everything operates on.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct GrowthCycleRow {
    pub id: i64,
    pub phase: String,
    /// JSON snapshot of the phase ranges at the time of the last change.
    pub parameters: String,
    pub autopilot_active: bool,
    pub start_date: i64,
    pub harvest_date: Option<i64>,
    pub created_at: i64,
}

impl GrowthCycleRow {
    /// Decode the stored parameter snapshot.
    pub fn snapshot(&self) -> Result<PhaseParameters> {
        serde_json::from_str(&self.parameters)
            .with_context(|| format!("corrupt parameter snapshot on cycle {}", self.id))
    }
}

/// One phase-occupancy interval. `end_date` null means currently open.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PhaseHistoryRow {
    pub id: i64,
    pub phase: String,
    pub start_date: i64,
    pub end_date: Option<i64>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SystemLogRow {
    pub id: i64,
    pub level: String,
    pub message: String,
    pub source: String,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SensorReadingRow {
    pub id: i64,
    pub ts: i64,
    pub ph: f64,
    pub tds: f64,
    pub water_temp: f64,
    pub air_temp: f64,
    pub humidity: f64,
}

/// Never serialized — the hash must not leave the process.
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub role: String,
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

const CYCLE_COLUMNS: &str =
    "id, phase, parameters, autopilot_active, start_date, harvest_date, created_at";

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/hydro/hub.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // An in-memory database exists per connection; a wider pool would
        // hand out blank databases alongside the migrated one.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Operator accounts
    // ----------------------------

    pub async fn upsert_user(&self, username: &str, password_hash: &str, role: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (username, password_hash, role)
            VALUES (?, ?, ?)
            ON CONFLICT(username) DO UPDATE SET
              password_hash=excluded.password_hash,
              role=excluded.role
            "#,
        )
        .bind(username)
        .bind(password_hash)
        .bind(role)
        .execute(&self.pool)
        .await
        .context("upsert_user failed")?;
        Ok(())
    }

    pub async fn find_user(&self, username: &str) -> Result<Option<UserRow>> {
        sqlx::query_as::<_, UserRow>(
            "SELECT id, username, password_hash, role FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .context("find_user failed")
    }

    // ----------------------------
    // Growth cycle + history reads
    // ----------------------------

    /// The newest cycle row, if any cycle has ever been created.
    pub async fn current_cycle(&self) -> Result<Option<GrowthCycleRow>> {
        sqlx::query_as::<_, GrowthCycleRow>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM growth_cycles ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .context("current_cycle failed")
    }

    /// Phase occupancy ledger, newest interval first.
    pub async fn phase_history(&self) -> Result<Vec<PhaseHistoryRow>> {
        sqlx::query_as::<_, PhaseHistoryRow>(
            "SELECT id, phase, start_date, end_date
             FROM growth_phase_history
             ORDER BY start_date DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("phase_history failed")
    }

    // ----------------------------
    // Audit log
    // ----------------------------

    pub async fn append_log(&self, level: &str, message: &str, source: &str, ts: i64) -> Result<()> {
        sqlx::query("INSERT INTO system_logs (level, message, source, ts) VALUES (?, ?, ?, ?)")
            .bind(level)
            .bind(message)
            .bind(source)
            .bind(ts)
            .execute(&self.pool)
            .await
            .context("append_log failed")?;
        Ok(())
    }

    pub async fn recent_logs(&self, limit: i64) -> Result<Vec<SystemLogRow>> {
        sqlx::query_as::<_, SystemLogRow>(
            "SELECT id, level, message, source, ts
             FROM system_logs
             ORDER BY ts DESC, id DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_logs failed")
    }

    // ----------------------------
    // Telemetry
    // ----------------------------

    pub async fn insert_reading(
        &self,
        ts: i64,
        ph: f64,
        tds: f64,
        water_temp: f64,
        air_temp: f64,
        humidity: f64,
    ) -> Result<SensorReadingRow> {
        let res = sqlx::query(
            "INSERT INTO sensor_readings (ts, ph, tds, water_temp, air_temp, humidity)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(ts)
        .bind(ph)
        .bind(tds)
        .bind(water_temp)
        .bind(air_temp)
        .bind(humidity)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;

        Ok(SensorReadingRow {
            id: res.last_insert_rowid(),
            ts,
            ph,
            tds,
            water_temp,
            air_temp,
            humidity,
        })
    }

    /// Most recent `limit` frames, returned oldest first (chart order).
    pub async fn recent_readings(&self, limit: i64) -> Result<Vec<SensorReadingRow>> {
        let mut rows = sqlx::query_as::<_, SensorReadingRow>(
            "SELECT id, ts, ph, tds, water_temp, air_temp, humidity
             FROM sensor_readings
             ORDER BY ts DESC, id DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_readings failed")?;
        rows.reverse();
        Ok(rows)
    }

    // ----------------------------
    // Transactional write units
    //
    // The cycle row, the history ledger, and the audit log must move
    // together: a history row closed without the cycle update (or the
    // reverse) is an inconsistent store. Each unit below is one transaction;
    // the controller additionally serializes callers so two units cannot
    // interleave their newest-row reads.
    // ----------------------------

    /// Apply a phase change: create-or-update the newest cycle, close the
    /// open history interval, open a new one, append the audit entry.
    /// Returns the cycle row as committed.
    pub async fn set_phase_tx(
        &self,
        phase_tag: &str,
        parameters_json: &str,
        log_message: &str,
        now: i64,
    ) -> Result<GrowthCycleRow> {
        let mut tx = self.pool.begin().await.context("begin set_phase tx")?;

        let existing = sqlx::query_as::<_, GrowthCycleRow>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM growth_cycles ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .fetch_optional(&mut *tx)
        .await
        .context("read newest cycle")?;

        let cycle_id = match existing {
            Some(cycle) => {
                sqlx::query("UPDATE growth_cycles SET phase = ?, parameters = ? WHERE id = ?")
                    .bind(phase_tag)
                    .bind(parameters_json)
                    .bind(cycle.id)
                    .execute(&mut *tx)
                    .await
                    .context("update cycle phase")?;
                cycle.id
            }
            None => {
                let res = sqlx::query(
                    "INSERT INTO growth_cycles
                       (phase, parameters, autopilot_active, start_date, created_at)
                     VALUES (?, ?, 0, ?, ?)",
                )
                .bind(phase_tag)
                .bind(parameters_json)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await
                .context("create cycle")?;
                res.last_insert_rowid()
            }
        };

        sqlx::query("UPDATE growth_phase_history SET end_date = ? WHERE end_date IS NULL")
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("close open history interval")?;

        sqlx::query("INSERT INTO growth_phase_history (phase, start_date) VALUES (?, ?)")
            .bind(phase_tag)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("open history interval")?;

        sqlx::query("INSERT INTO system_logs (level, message, source, ts) VALUES ('INFO', ?, 'user', ?)")
            .bind(log_message)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("append phase-change log")?;

        let row = sqlx::query_as::<_, GrowthCycleRow>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM growth_cycles WHERE id = ?"
        ))
        .bind(cycle_id)
        .fetch_one(&mut *tx)
        .await
        .context("re-read cycle")?;

        tx.commit().await.context("commit set_phase tx")?;
        Ok(row)
    }

    /// Flip the autopilot flag on the newest cycle and append the audit
    /// entry, atomically. `Ok(None)` when no cycle exists — nothing written.
    pub async fn set_autopilot_tx(
        &self,
        active: bool,
        log_level: &str,
        log_message: &str,
        now: i64,
    ) -> Result<Option<GrowthCycleRow>> {
        let mut tx = self.pool.begin().await.context("begin autopilot tx")?;

        let existing = sqlx::query_as::<_, GrowthCycleRow>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM growth_cycles ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .fetch_optional(&mut *tx)
        .await
        .context("read newest cycle")?;

        let Some(cycle) = existing else {
            return Ok(None);
        };

        sqlx::query("UPDATE growth_cycles SET autopilot_active = ? WHERE id = ?")
            .bind(active)
            .bind(cycle.id)
            .execute(&mut *tx)
            .await
            .context("update autopilot flag")?;

        sqlx::query("INSERT INTO system_logs (level, message, source, ts) VALUES (?, ?, 'user', ?)")
            .bind(log_level)
            .bind(log_message)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("append autopilot log")?;

        let row = sqlx::query_as::<_, GrowthCycleRow>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM growth_cycles WHERE id = ?"
        ))
        .bind(cycle.id)
        .fetch_one(&mut *tx)
        .await
        .context("re-read cycle")?;

        tx.commit().await.context("commit autopilot tx")?;
        Ok(Some(row))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
