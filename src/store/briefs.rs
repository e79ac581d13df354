//! Collaboration briefs.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BriefStatus {
    Draft,
    Shortlisted,
    Approved,
    Rejected,
    RejectedByThreshold,
}

impl BriefStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Shortlisted => "shortlisted",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::RejectedByThreshold => "rejected_by_threshold",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "shortlisted" => Self::Shortlisted,
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            "rejected_by_threshold" => Self::RejectedByThreshold,
            _ => Self::Draft,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BriefRecord {
    pub id: String,
    pub run_id: String,
    pub score: f64,
    /// Sorted canonical repo full names, length 2..=4.
    pub repo_ids: Vec<String>,
    pub content_json: Value,
    pub markdown: String,
    pub outreach_md: String,
    pub status: BriefStatus,
    pub created_at: i64,
}

impl Store {
    pub fn insert_brief(&self, brief: &BriefRecord) -> Result<(), StoreError> {
        let repo_ids = serde_json::to_string(&brief.repo_ids)?;
        let content = serde_json::to_string(&brief.content_json)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO briefs \
                 (id, run_id, score, repo_ids_json, content_json, markdown, outreach_md, \
                  status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    brief.id,
                    brief.run_id,
                    brief.score,
                    repo_ids,
                    content,
                    brief.markdown,
                    brief.outreach_md,
                    brief.status.as_str(),
                    brief.created_at,
                ],
            )?;
            Ok(())
        })
    }

    /// `status` is the only mutable brief field (manual review decisions).
    pub fn update_brief_status(&self, brief_id: &str, status: BriefStatus) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE briefs SET status = ?1 WHERE id = ?2",
                params![status.as_str(), brief_id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("brief {brief_id}")));
            }
            Ok(())
        })
    }

    pub fn briefs_for_run(&self, run_id: &str) -> Result<Vec<BriefRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, score, repo_ids_json, content_json, markdown, \
                        outreach_md, status, created_at \
                 FROM briefs WHERE run_id = ?1 ORDER BY score DESC, id ASC",
            )?;
            let rows = stmt
                .query_map(params![run_id], map_brief_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(finish_brief_row).collect()
        })
    }

    pub fn get_brief(&self, brief_id: &str) -> Result<Option<BriefRecord>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, run_id, score, repo_ids_json, content_json, markdown, \
                            outreach_md, status, created_at \
                     FROM briefs WHERE id = ?1",
                    params![brief_id],
                    map_brief_row,
                )
                .optional()?;
            row.map(finish_brief_row).transpose()
        })
    }
}

type BriefRow = (
    String,
    String,
    f64,
    String,
    String,
    String,
    String,
    String,
    i64,
);

fn map_brief_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BriefRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn finish_brief_row(row: BriefRow) -> Result<BriefRecord, StoreError> {
    let (id, run_id, score, repo_ids, content, markdown, outreach_md, status, created_at) = row;
    Ok(BriefRecord {
        id,
        run_id,
        score,
        repo_ids: serde_json::from_str(&repo_ids)?,
        content_json: serde_json::from_str(&content)?,
        markdown,
        outreach_md,
        status: BriefStatus::from_str(&status),
        created_at,
    })
}
