mod processed;

pub use processed::{ProcessedEntry, ProcessedSet};

use crate::state::{CiStatus, PrFailureRecord, PrStage, PrState};
use chrono::{DateTime, Duration, Utc};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS autopilot_pr_state (
    pr_number INTEGER PRIMARY KEY,
    pr_url TEXT NOT NULL DEFAULT '',
    issue_number INTEGER NOT NULL DEFAULT 0,
    branch_name TEXT NOT NULL DEFAULT '',
    head_sha TEXT NOT NULL DEFAULT '',
    stage TEXT NOT NULL,
    ci_status TEXT NOT NULL,
    last_checked TEXT,
    ci_wait_started_at TEXT,
    merge_attempts INTEGER NOT NULL DEFAULT 0,
    error TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS autopilot_processed (
    issue_number INTEGER PRIMARY KEY,
    processed_at TEXT NOT NULL,
    result TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS autopilot_processed_linear (
    id TEXT PRIMARY KEY,
    processed_at TEXT NOT NULL,
    result TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS autopilot_processed_plane (
    id TEXT PRIMARY KEY,
    processed_at TEXT NOT NULL,
    result TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS autopilot_processed_jira (
    id TEXT PRIMARY KEY,
    processed_at TEXT NOT NULL,
    result TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS autopilot_processed_asana (
    id TEXT PRIMARY KEY,
    processed_at TEXT NOT NULL,
    result TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS autopilot_processed_azure (
    id INTEGER PRIMARY KEY,
    processed_at TEXT NOT NULL,
    result TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS autopilot_processed_gitlab (
    id INTEGER PRIMARY KEY,
    processed_at TEXT NOT NULL,
    result TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS autopilot_pr_failures (
    pr_number INTEGER PRIMARY KEY,
    failure_count INTEGER NOT NULL,
    last_failure_time TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS autopilot_metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS autopilot_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_at TEXT NOT NULL,
    prs_merged INTEGER NOT NULL,
    prs_failed INTEGER NOT NULL,
    prs_conflicting INTEGER NOT NULL,
    circuit_breaker_trips INTEGER NOT NULL,
    api_errors_total INTEGER NOT NULL,
    issues_succeeded INTEGER NOT NULL,
    issues_failed INTEGER NOT NULL,
    issues_rate_limited INTEGER NOT NULL,
    avg_time_to_merge_ms INTEGER NOT NULL,
    avg_ci_wait_ms INTEGER NOT NULL,
    avg_execution_ms INTEGER NOT NULL,
    success_rate REAL NOT NULL,
    api_error_rate REAL NOT NULL
);
"#;

// Columns added after the first released schema. Applied on every open;
// "duplicate column" means the migration already ran.
const MIGRATIONS: &[&str] = &[
    "ALTER TABLE autopilot_pr_state ADD COLUMN release_version TEXT NOT NULL DEFAULT ''",
    "ALTER TABLE autopilot_pr_state ADD COLUMN release_bump_type TEXT NOT NULL DEFAULT ''",
    "ALTER TABLE autopilot_pr_state ADD COLUMN merge_sha TEXT",
];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to create store directory: {0}")]
    CreateDir(#[from] std::io::Error),

    #[error("corrupt row: {0}")]
    Decode(String),
}

// PR row exactly as stored, before stage/status strings are validated.
struct RawPrRow {
    pr_number: u64,
    pr_url: String,
    issue_number: u64,
    branch_name: String,
    head_sha: String,
    merge_sha: Option<String>,
    stage: String,
    ci_status: String,
    last_checked: Option<DateTime<Utc>>,
    ci_wait_started_at: Option<DateTime<Utc>>,
    merge_attempts: u32,
    error: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    release_version: String,
    release_bump_type: String,
}

/// Flattened metrics history row, one per persister tick.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsRow {
    pub recorded_at: DateTime<Utc>,
    pub prs_merged: u64,
    pub prs_failed: u64,
    pub prs_conflicting: u64,
    pub circuit_breaker_trips: u64,
    pub api_errors_total: u64,
    pub issues_succeeded: u64,
    pub issues_failed: u64,
    pub issues_rate_limited: u64,
    pub avg_time_to_merge_ms: i64,
    pub avg_ci_wait_ms: i64,
    pub avg_execution_ms: i64,
    pub success_rate: f64,
    pub api_error_rate: f64,
}

/// Durable autopilot state, backed by an embedded SQLite database in WAL
/// mode with a 5-second busy timeout. All writes are upserts keyed on the
/// natural primary key; `updated_at` is stamped by the store on every save.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!("Opened state store with journal mode '{}'", mode);
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(SCHEMA)?;
        for statement in MIGRATIONS {
            if let Err(e) = conn.execute(statement, []) {
                if !e.to_string().contains("duplicate column") {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    // PR lifecycle rows

    pub fn save_pr_state(&self, pr: &PrState) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
INSERT INTO autopilot_pr_state (
    pr_number, pr_url, issue_number, branch_name, head_sha, merge_sha,
    stage, ci_status, last_checked, ci_wait_started_at,
    merge_attempts, error, created_at, updated_at,
    release_version, release_bump_type
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
ON CONFLICT(pr_number) DO UPDATE SET
    pr_url = excluded.pr_url,
    issue_number = excluded.issue_number,
    branch_name = excluded.branch_name,
    head_sha = excluded.head_sha,
    merge_sha = excluded.merge_sha,
    stage = excluded.stage,
    ci_status = excluded.ci_status,
    last_checked = excluded.last_checked,
    ci_wait_started_at = excluded.ci_wait_started_at,
    merge_attempts = excluded.merge_attempts,
    error = excluded.error,
    updated_at = excluded.updated_at,
    release_version = excluded.release_version,
    release_bump_type = excluded.release_bump_type
"#,
            params![
                pr.pr_number,
                pr.pr_url,
                pr.issue_number,
                pr.branch_name,
                pr.head_sha,
                pr.merge_sha,
                pr.stage.as_str(),
                pr.ci_status.as_str(),
                pr.last_checked,
                pr.ci_wait_started_at,
                pr.merge_attempts,
                pr.error,
                pr.created_at,
                Utc::now(),
                pr.release_version,
                pr.release_bump_type,
            ],
        )?;
        Ok(())
    }

    pub fn get_pr_state(&self, pr_number: u64) -> Result<Option<PrState>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("{} WHERE pr_number = ?1", Self::select_pr_states()),
                params![pr_number],
                Self::read_pr_row,
            )
            .optional()?;
        row.map(Self::decode_pr_row).transpose()
    }

    pub fn load_all_pr_states(&self) -> Result<Vec<PrState>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(Self::select_pr_states())?;
        let rows = statement.query_map([], Self::read_pr_row)?;
        let mut states = Vec::new();
        for row in rows {
            states.push(Self::decode_pr_row(row?)?);
        }
        Ok(states)
    }

    pub fn remove_pr_state(&self, pr_number: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM autopilot_pr_state WHERE pr_number = ?1",
            params![pr_number],
        )?;
        Ok(())
    }

    /// Deletes rows that reached a terminal stage before the cutoff.
    /// In-flight rows are never eligible.
    pub fn purge_terminal_pr_states(&self, older_than: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - older_than;
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM autopilot_pr_state \
             WHERE stage IN ('done', 'failed') \
             AND julianday(updated_at) < julianday(?1)",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    fn select_pr_states() -> &'static str {
        "SELECT pr_number, pr_url, issue_number, branch_name, head_sha, merge_sha, \
         stage, ci_status, last_checked, ci_wait_started_at, \
         merge_attempts, error, created_at, updated_at, \
         release_version, release_bump_type \
         FROM autopilot_pr_state"
    }

    fn read_pr_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawPrRow> {
        Ok(RawPrRow {
            pr_number: row.get(0)?,
            pr_url: row.get(1)?,
            issue_number: row.get(2)?,
            branch_name: row.get(3)?,
            head_sha: row.get(4)?,
            merge_sha: row.get(5)?,
            stage: row.get(6)?,
            ci_status: row.get(7)?,
            last_checked: row.get(8)?,
            ci_wait_started_at: row.get(9)?,
            merge_attempts: row.get(10)?,
            error: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            release_version: row.get(14)?,
            release_bump_type: row.get(15)?,
        })
    }

    fn decode_pr_row(raw: RawPrRow) -> Result<PrState, StoreError> {
        let stage: PrStage = raw
            .stage
            .parse()
            .map_err(|e| StoreError::Decode(format!("{}", e)))?;
        let ci_status: CiStatus = raw
            .ci_status
            .parse()
            .map_err(|e| StoreError::Decode(format!("{}", e)))?;
        Ok(PrState {
            pr_number: raw.pr_number,
            pr_url: raw.pr_url,
            issue_number: raw.issue_number,
            branch_name: raw.branch_name,
            head_sha: raw.head_sha,
            merge_sha: raw.merge_sha,
            stage,
            ci_status,
            last_checked: raw.last_checked,
            ci_wait_started_at: raw.ci_wait_started_at,
            merge_attempts: raw.merge_attempts,
            error: raw.error,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
            release_version: raw.release_version,
            release_bump_type: raw.release_bump_type,
        })
    }

    // Per-PR failure counters

    pub fn save_pr_failures(&self, record: &PrFailureRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO autopilot_pr_failures (pr_number, failure_count, last_failure_time) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(pr_number) DO UPDATE SET \
             failure_count = excluded.failure_count, \
             last_failure_time = excluded.last_failure_time",
            params![record.pr_number, record.failure_count, record.last_failure_time],
        )?;
        Ok(())
    }

    pub fn load_all_pr_failures(&self) -> Result<Vec<PrFailureRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn
            .prepare("SELECT pr_number, failure_count, last_failure_time FROM autopilot_pr_failures")?;
        let rows = statement.query_map([], |row| {
            Ok(PrFailureRecord {
                pr_number: row.get(0)?,
                failure_count: row.get(1)?,
                last_failure_time: row.get(2)?,
            })
        })?;
        let mut records = Vec::new();
        for record in rows {
            records.push(record?);
        }
        Ok(records)
    }

    pub fn remove_pr_failures(&self, pr_number: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM autopilot_pr_failures WHERE pr_number = ?1",
            params![pr_number],
        )?;
        Ok(())
    }

    // Opaque cross-run metadata

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO autopilot_metadata (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
             updated_at = excluded.updated_at",
            params![key, value, Utc::now()],
        )?;
        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM autopilot_metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    // Processed-ID ledgers, one per upstream tracker

    pub fn github_processed(&self) -> ProcessedSet<'_, i64> {
        ProcessedSet::new(&self.conn, "autopilot_processed", "issue_number")
    }

    pub fn linear_processed(&self) -> ProcessedSet<'_, String> {
        ProcessedSet::new(&self.conn, "autopilot_processed_linear", "id")
    }

    pub fn plane_processed(&self) -> ProcessedSet<'_, String> {
        ProcessedSet::new(&self.conn, "autopilot_processed_plane", "id")
    }

    pub fn jira_processed(&self) -> ProcessedSet<'_, String> {
        ProcessedSet::new(&self.conn, "autopilot_processed_jira", "id")
    }

    pub fn asana_processed(&self) -> ProcessedSet<'_, String> {
        ProcessedSet::new(&self.conn, "autopilot_processed_asana", "id")
    }

    pub fn azure_processed(&self) -> ProcessedSet<'_, i64> {
        ProcessedSet::new(&self.conn, "autopilot_processed_azure", "id")
    }

    pub fn gitlab_processed(&self) -> ProcessedSet<'_, i64> {
        ProcessedSet::new(&self.conn, "autopilot_processed_gitlab", "id")
    }

    /// Sweeps every tracker ledger in one pass.
    pub fn purge_old_processed_issues(&self, older_than: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - older_than;
        let tables = [
            "autopilot_processed",
            "autopilot_processed_linear",
            "autopilot_processed_plane",
            "autopilot_processed_jira",
            "autopilot_processed_asana",
            "autopilot_processed_azure",
            "autopilot_processed_gitlab",
        ];
        let conn = self.conn.lock().unwrap();
        let mut deleted = 0;
        for table in tables {
            deleted += conn.execute(
                &format!(
                    "DELETE FROM {} WHERE julianday(processed_at) < julianday(?1)",
                    table
                ),
                params![cutoff],
            )?;
        }
        Ok(deleted)
    }

    // Metrics history

    pub fn insert_metrics_snapshot(&self, row: &MetricsRow) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
INSERT INTO autopilot_metrics (
    recorded_at, prs_merged, prs_failed, prs_conflicting,
    circuit_breaker_trips, api_errors_total,
    issues_succeeded, issues_failed, issues_rate_limited,
    avg_time_to_merge_ms, avg_ci_wait_ms, avg_execution_ms,
    success_rate, api_error_rate
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
"#,
            params![
                row.recorded_at,
                row.prs_merged,
                row.prs_failed,
                row.prs_conflicting,
                row.circuit_breaker_trips,
                row.api_errors_total,
                row.issues_succeeded,
                row.issues_failed,
                row.issues_rate_limited,
                row.avg_time_to_merge_ms,
                row.avg_ci_wait_ms,
                row.avg_execution_ms,
                row.success_rate,
                row.api_error_rate,
            ],
        )?;
        Ok(())
    }

    pub fn purge_old_metrics(&self, older_than: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - older_than;
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM autopilot_metrics WHERE julianday(recorded_at) < julianday(?1)",
            params![cutoff],
        )?;
        Ok(deleted)
    }
}
