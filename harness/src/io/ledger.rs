//! SQLite-backed ledger of judged runs and human score overrides.
//!
//! Runs are immutable once recorded. Overrides are append-only rows in
//! `score_overrides`; the newest row for a run is the one in effect, and
//! every read substitutes it for the original score, pass and status.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::core::test_tree::{TestTreeNode, build_test_tree};
use crate::core::types::{CommandResult, Status, Thresholds};

pub const DEFAULT_LEDGER_FILE: &str = "ledger.db";

/// What the judge saw: the diff and every command transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    pub diff: String,
    pub commands: Vec<CommandResult>,
}

/// A run as recorded, before the ledger assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub test_id: String,
    pub suite_path: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub agent_runner: String,
    pub judge_model: String,
    pub score: f64,
    pub pass: bool,
    pub status: Status,
    pub reason: String,
    pub improvement: String,
    pub context: RunContext,
    pub duration_ms: u64,
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreOverride {
    pub id: i64,
    pub run_id: i64,
    pub score: f64,
    pub pass: bool,
    pub status: Status,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// A stored run plus the override currently in effect, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: i64,
    #[serde(flatten)]
    pub record: RunRecord,
    #[serde(rename = "override")]
    pub score_override: Option<ScoreOverride>,
}

impl LedgerEntry {
    pub fn effective_score(&self) -> f64 {
        self.score_override
            .as_ref()
            .map_or(self.record.score, |o| o.score)
    }

    pub fn effective_status(&self) -> Status {
        self.score_override
            .as_ref()
            .map_or(self.record.status, |o| o.status)
    }

    pub fn effective_pass(&self) -> bool {
        self.score_override
            .as_ref()
            .map_or(self.record.pass, |o| o.pass)
    }
}

/// Aggregates over effective (override-aware) values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub total_runs: u64,
    pub passed: u64,
    pub failed: u64,
    pub warnings: u64,
    pub pass_rate: f64,
    pub average_score: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OverrideError {
    #[error("override score must be within [0, 1] (got {0})")]
    InvalidScore(f64),
    #[error("override reason must not be blank")]
    BlankReason,
    #[error("run {0} not found")]
    RunNotFound(i64),
}

pub trait Ledger {
    fn record_run(&self, record: &RunRecord) -> Result<LedgerEntry>;

    /// Newest first, optionally limited to one test.
    fn get_runs(&self, test_id: Option<&str>) -> Result<Vec<LedgerEntry>>;

    fn get_run_by_id(&self, id: i64) -> Result<Option<LedgerEntry>>;

    /// Distinct test ids, sorted.
    fn get_test_ids(&self) -> Result<Vec<String>>;

    fn get_test_tree(&self) -> Result<Vec<TestTreeNode>>;

    /// Newest entry per (test, runner) pair.
    fn get_latest_entries(&self) -> Result<Vec<LedgerEntry>>;

    fn get_stats(&self, test_id: Option<&str>) -> Result<RunStats>;

    fn override_run_score(&self, run_id: i64, score: f64, reason: &str) -> Result<ScoreOverride>;

    /// Newest first.
    fn get_run_overrides(&self, run_id: i64) -> Result<Vec<ScoreOverride>>;
}

/// Ledger stored in a single SQLite file. Each call opens its own connection.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    path: PathBuf,
}

const CREATE_TABLES: &str = "\
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    test_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    agent_runner TEXT NOT NULL,
    judge_model TEXT NOT NULL,
    score REAL NOT NULL,
    pass INTEGER NOT NULL,
    reason TEXT NOT NULL,
    improvement TEXT NOT NULL,
    context TEXT NOT NULL,
    duration_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS score_overrides (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id),
    score REAL NOT NULL,
    pass INTEGER NOT NULL,
    status TEXT NOT NULL,
    reason TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_test_id ON runs(test_id);
CREATE INDEX IF NOT EXISTS idx_score_overrides_run_id ON score_overrides(run_id, id);";

/// Columns added after the first schema, as (column, definition).
const RUN_MIGRATIONS: &[(&str, &str)] = &[
    ("suite_path", "TEXT NOT NULL DEFAULT '[]'"),
    ("status", "TEXT"),
    ("threshold_warn", "REAL NOT NULL DEFAULT 0.8"),
    ("threshold_fail", "REAL NOT NULL DEFAULT 0.5"),
];

/// Newest override per run, joined onto runs.
const ENTRY_SELECT: &str = "\
WITH latest AS (
    SELECT id, run_id, score, pass, status, reason, timestamp,
           ROW_NUMBER() OVER (PARTITION BY run_id ORDER BY id DESC) AS rn
    FROM score_overrides
)
SELECT r.id, r.test_id, r.suite_path, r.timestamp, r.agent_runner, r.judge_model,
       r.score, r.pass, r.status, r.reason, r.improvement, r.context, r.duration_ms,
       r.threshold_warn, r.threshold_fail,
       l.id AS override_id, l.score AS override_score, l.pass AS override_pass,
       l.status AS override_status, l.reason AS override_reason,
       l.timestamp AS override_timestamp
FROM runs r
LEFT JOIN latest l ON l.run_id = r.id AND l.rn = 1";

impl SqliteLedger {
    /// Open (creating and migrating as needed) the ledger at `path`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create ledger directory {}", parent.display()))?;
        }
        let ledger = Self { path };
        let conn = ledger.connect()?;
        conn.execute_batch(CREATE_TABLES)
            .context("create ledger tables")?;
        migrate(&conn)?;
        info!("ledger ready");
        Ok(ledger)
    }

    /// Open `ledger.db` inside an output directory.
    pub fn open_in(output_dir: &Path) -> Result<Self> {
        Self::open(output_dir.join(DEFAULT_LEDGER_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("open ledger {}", self.path.display()))?;
        conn.execute_batch(
            "PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )
        .context("configure ledger connection")?;
        Ok(conn)
    }

    fn query_entries(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<LedgerEntry>> {
        let conn = self.connect()?;
        let sql = format!("{ENTRY_SELECT} {filter}");
        let mut stmt = conn.prepare(&sql).context("prepare entry query")?;
        let entries = stmt
            .query_map(args, row_to_entry)
            .context("query entries")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read entries")?;
        Ok(entries)
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info('runs')")
        .context("inspect runs table")?;
    let existing = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (column, definition) in RUN_MIGRATIONS {
        if existing.iter().any(|name| name == column) {
            continue;
        }
        debug!(column, "adding runs column");
        conn.execute(&format!("ALTER TABLE runs ADD COLUMN {column} {definition}"), [])
            .with_context(|| format!("add runs.{column}"))?;
    }
    Ok(())
}

impl Ledger for SqliteLedger {
    #[instrument(skip_all, fields(test_id = %record.test_id, runner = %record.agent_runner, score = record.score))]
    fn record_run(&self, record: &RunRecord) -> Result<LedgerEntry> {
        let conn = self.connect()?;
        let suite_path = serde_json::to_string(&record.suite_path).context("encode suite path")?;
        let context = serde_json::to_string(&record.context).context("encode run context")?;
        conn.execute(
            "INSERT INTO runs (test_id, suite_path, timestamp, agent_runner, judge_model, score, \
             pass, status, reason, improvement, context, duration_ms, threshold_warn, threshold_fail) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.test_id,
                suite_path,
                record.timestamp.to_rfc3339(),
                record.agent_runner,
                record.judge_model,
                record.score,
                record.pass,
                record.status.as_str(),
                record.reason,
                record.improvement,
                context,
                i64::try_from(record.duration_ms).unwrap_or(i64::MAX),
                record.thresholds.warn,
                record.thresholds.fail,
            ],
        )
        .context("insert run")?;
        let id = conn.last_insert_rowid();
        debug!(id, "run recorded");
        Ok(LedgerEntry {
            id,
            record: record.clone(),
            score_override: None,
        })
    }

    fn get_runs(&self, test_id: Option<&str>) -> Result<Vec<LedgerEntry>> {
        self.query_entries(
            "WHERE (?1 IS NULL OR r.test_id = ?1) ORDER BY r.id DESC",
            &[&test_id],
        )
    }

    fn get_run_by_id(&self, id: i64) -> Result<Option<LedgerEntry>> {
        Ok(self
            .query_entries("WHERE r.id = ?1", &[&id])?
            .into_iter()
            .next())
    }

    fn get_test_ids(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT DISTINCT test_id FROM runs ORDER BY test_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()
            .context("read test ids")?;
        Ok(ids)
    }

    fn get_test_tree(&self) -> Result<Vec<TestTreeNode>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT test_id, suite_path FROM runs \
             GROUP BY test_id, suite_path ORDER BY MIN(id)",
        )?;
        let pairs = stmt
            .query_map([], |row| {
                let test_id: String = row.get(0)?;
                let suite_path = json_column::<Vec<String>>(row, 1)?;
                Ok((test_id, suite_path))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read test paths")?;
        Ok(build_test_tree(
            pairs
                .iter()
                .map(|(test_id, path)| (test_id.as_str(), path.as_slice())),
        ))
    }

    fn get_latest_entries(&self) -> Result<Vec<LedgerEntry>> {
        self.query_entries(
            "WHERE r.id IN (SELECT MAX(id) FROM runs GROUP BY test_id, agent_runner) \
             ORDER BY r.test_id, r.agent_runner",
            &[],
        )
    }

    fn get_stats(&self, test_id: Option<&str>) -> Result<RunStats> {
        let conn = self.connect()?;
        let (total, passed, warnings, average): (i64, i64, i64, Option<f64>) = conn
            .query_row(
                "WITH latest AS (
                    SELECT run_id, score, pass, status,
                           ROW_NUMBER() OVER (PARTITION BY run_id ORDER BY id DESC) AS rn
                    FROM score_overrides
                )
                SELECT COUNT(*),
                       COALESCE(SUM(CASE WHEN COALESCE(l.pass, r.pass) THEN 1 ELSE 0 END), 0),
                       COALESCE(SUM(CASE WHEN COALESCE(l.status, r.status,
                           CASE WHEN r.score >= r.threshold_warn THEN 'PASS'
                                WHEN r.score >= r.threshold_fail THEN 'WARN'
                                ELSE 'FAIL' END) = 'WARN'
                           THEN 1 ELSE 0 END), 0),
                       AVG(COALESCE(l.score, r.score))
                FROM runs r
                LEFT JOIN latest l ON l.run_id = r.id AND l.rn = 1
                WHERE (?1 IS NULL OR r.test_id = ?1)",
                params![test_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .context("compute stats")?;
        let total = u64::try_from(total).unwrap_or(0);
        let passed = u64::try_from(passed).unwrap_or(0);
        Ok(RunStats {
            total_runs: total,
            passed,
            failed: total.saturating_sub(passed),
            warnings: u64::try_from(warnings).unwrap_or(0),
            pass_rate: if total == 0 {
                0.0
            } else {
                passed as f64 / total as f64
            },
            average_score: average.unwrap_or(0.0),
        })
    }

    #[instrument(skip_all, fields(run_id = run_id, score = score))]
    fn override_run_score(&self, run_id: i64, score: f64, reason: &str) -> Result<ScoreOverride> {
        if !(0.0..=1.0).contains(&score) {
            return Err(OverrideError::InvalidScore(score).into());
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(OverrideError::BlankReason.into());
        }

        let mut conn = self.connect()?;
        let tx = conn.transaction().context("begin override")?;
        let thresholds = tx
            .query_row(
                "SELECT threshold_warn, threshold_fail FROM runs WHERE id = ?1",
                params![run_id],
                |row| {
                    Ok(Thresholds {
                        warn: row.get(0)?,
                        fail: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("look up run thresholds")?
            .ok_or(OverrideError::RunNotFound(run_id))?;

        let status = thresholds.status_for(score);
        let timestamp = Utc::now();
        tx.execute(
            "INSERT INTO score_overrides (run_id, score, pass, status, reason, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                score,
                status.is_pass(),
                status.as_str(),
                reason,
                timestamp.to_rfc3339()
            ],
        )
        .context("insert override")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("commit override")?;
        info!(id, status = status.as_str(), "score overridden");

        Ok(ScoreOverride {
            id,
            run_id,
            score,
            pass: status.is_pass(),
            status,
            reason: reason.to_string(),
            timestamp,
        })
    }

    fn get_run_overrides(&self, run_id: i64) -> Result<Vec<ScoreOverride>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, score, pass, status, reason, timestamp \
             FROM score_overrides WHERE run_id = ?1 ORDER BY id DESC",
        )?;
        let overrides = stmt
            .query_map(params![run_id], row_to_override)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read overrides")?;
        Ok(overrides)
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let pass: bool = row.get("pass")?;
    let score: f64 = row.get("score")?;
    let thresholds = Thresholds {
        warn: row.get("threshold_warn")?,
        fail: row.get("threshold_fail")?,
    };
    let status = match row.get::<_, Option<String>>("status")? {
        Some(text) => parse_status(&text, row, "status")?,
        // Rows recorded before the status column existed.
        None => thresholds.status_for(score),
    };
    let duration_ms: i64 = row.get("duration_ms")?;
    let record = RunRecord {
        test_id: row.get("test_id")?,
        suite_path: json_column(row, "suite_path")?,
        timestamp: timestamp_column(row, "timestamp")?,
        agent_runner: row.get("agent_runner")?,
        judge_model: row.get("judge_model")?,
        score,
        pass,
        status,
        reason: row.get("reason")?,
        improvement: row.get("improvement")?,
        context: json_column(row, "context")?,
        duration_ms: u64::try_from(duration_ms).unwrap_or(0),
        thresholds,
    };

    let score_override = match row.get::<_, Option<i64>>("override_id")? {
        Some(id) => {
            let status_text: String = row.get("override_status")?;
            Some(ScoreOverride {
                id,
                run_id: row.get("id")?,
                score: row.get("override_score")?,
                pass: row.get("override_pass")?,
                status: parse_status(&status_text, row, "override_status")?,
                reason: row.get("override_reason")?,
                timestamp: timestamp_column(row, "override_timestamp")?,
            })
        }
        None => None,
    };

    Ok(LedgerEntry {
        id: row.get("id")?,
        record,
        score_override,
    })
}

fn row_to_override(row: &Row<'_>) -> rusqlite::Result<ScoreOverride> {
    let status_text: String = row.get(4)?;
    Ok(ScoreOverride {
        id: row.get(0)?,
        run_id: row.get(1)?,
        score: row.get(2)?,
        pass: row.get(3)?,
        status: parse_status(&status_text, row, 4)?,
        reason: row.get(5)?,
        timestamp: timestamp_column(row, 6)?,
    })
}

fn column_index<I: rusqlite::RowIndex>(row: &Row<'_>, idx: I) -> usize {
    idx.idx(row.as_ref()).unwrap_or(0)
}

fn parse_status<I: rusqlite::RowIndex>(text: &str, row: &Row<'_>, idx: I) -> rusqlite::Result<Status> {
    Status::parse(text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column_index(row, idx),
            Type::Text,
            format!("unknown status {text:?}").into(),
        )
    })
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: impl rusqlite::RowIndex + Copy,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(column_index(row, idx), Type::Text, Box::new(err))
    })
}

fn timestamp_column(
    row: &Row<'_>,
    idx: impl rusqlite::RowIndex + Copy,
) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                column_index(row, idx),
                Type::Text,
                Box::new(err),
            )
        })
}
