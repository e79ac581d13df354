//! Runs, steps, audit events and rate-limit snapshots.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Store, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub created_at: i64,
    pub args_json: Value,
    pub config_hash: String,
    pub git_commit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "skipped" => Self::Skipped,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: i64,
    pub run_id: String,
    pub name: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub status: Option<StepStatus>,
    pub stats_json: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub run_id: String,
    pub ts: i64,
    pub level: String,
    pub scope: String,
    pub event: String,
    pub message: String,
    pub data_json: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub search_limit: i64,
    pub search_remaining: i64,
    pub search_reset: i64,
    pub core_limit: i64,
    pub core_remaining: i64,
    pub core_reset: i64,
}

impl Store {
    pub fn insert_run(&self, run: &Run) -> Result<(), StoreError> {
        let args = serde_json::to_string(&run.args_json)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (id, created_at, args_json, config_hash, git_commit) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run.id, run.created_at, args, run.config_hash, run.git_commit],
            )?;
            Ok(())
        })
    }

    pub fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, created_at, args_json, config_hash, git_commit \
                 FROM runs WHERE id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))
            .and_then(|(id, created_at, args, config_hash, git_commit)| {
                Ok(Run {
                    id,
                    created_at,
                    args_json: serde_json::from_str(&args)?,
                    config_hash,
                    git_commit,
                })
            })
        })
    }

    pub fn start_step(&self, run_id: &str, name: &str, started_at: i64) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO steps (run_id, name, started_at) VALUES (?1, ?2, ?3)",
                params![run_id, name, started_at],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn finish_step(
        &self,
        step_id: i64,
        finished_at: i64,
        status: StepStatus,
        stats: &Value,
    ) -> Result<(), StoreError> {
        let stats = serde_json::to_string(stats)?;
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE steps SET finished_at = ?1, status = ?2, stats_json = ?3 \
                 WHERE id = ?4 AND finished_at IS NULL",
                params![finished_at, status.as_str(), stats, step_id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("open step {step_id}")));
            }
            Ok(())
        })
    }

    pub fn steps_for_run(&self, run_id: &str) -> Result<Vec<Step>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, name, started_at, finished_at, status, stats_json \
                 FROM steps WHERE run_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![run_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(id, run_id, name, started_at, finished_at, status, stats)| {
                    Ok(Step {
                        id,
                        run_id,
                        name,
                        started_at,
                        finished_at,
                        status: status.as_deref().map(StepStatus::from_str),
                        stats_json: stats.as_deref().map(serde_json::from_str).transpose()?,
                    })
                })
                .collect()
        })
    }

    /// Append an audit row. The caller is responsible for redaction; the
    /// orchestrator is the only writer and always redacts first.
    pub fn insert_audit(
        &self,
        run_id: &str,
        ts: i64,
        level: &str,
        scope: &str,
        event: &str,
        message: &str,
        data: &Value,
    ) -> Result<(), StoreError> {
        let data = serde_json::to_string(data)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_log (run_id, ts, level, scope, event, message, data_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![run_id, ts, level, scope, event, message, data],
            )?;
            Ok(())
        })
    }

    pub fn audit_for_run(&self, run_id: &str) -> Result<Vec<AuditEvent>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, ts, level, scope, event, message, data_json \
                 FROM audit_log WHERE run_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![run_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(id, run_id, ts, level, scope, event, message, data)| {
                    Ok(AuditEvent {
                        id,
                        run_id,
                        ts,
                        level,
                        scope,
                        event,
                        message,
                        data_json: serde_json::from_str(&data)?,
                    })
                })
                .collect()
        })
    }

    pub fn count_audit_events(&self, run_id: &str, event: &str) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM audit_log WHERE run_id = ?1 AND event = ?2",
                params![run_id, event],
                |row| row.get(0),
            )?)
        })
    }

    /// Delete audit rows older than the cutoff. Returns rows removed.
    pub fn prune_audit_log(&self, cutoff_ts: i64) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM audit_log WHERE ts < ?1",
                params![cutoff_ts],
            )?)
        })
    }

    pub fn insert_rate_limit_snapshot(
        &self,
        run_id: &str,
        taken_at: i64,
        snap: &RateLimitSnapshot,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rate_limit_snapshots \
                 (run_id, taken_at, search_limit, search_remaining, search_reset, \
                  core_limit, core_remaining, core_reset) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run_id,
                    taken_at,
                    snap.search_limit,
                    snap.search_remaining,
                    snap.search_reset,
                    snap.core_limit,
                    snap.core_remaining,
                    snap.core_reset,
                ],
            )?;
            Ok(())
        })
    }
}
