//! Analyses and keywords.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{Store, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: i64,
    pub run_id: String,
    pub repo_id: String,
    pub model: String,
    pub prompt_id: String,
    pub prompt_version: String,
    /// Input snapshot: readme hash and excerpt length, never the full README.
    pub input_json: Value,
    pub output_json: Value,
    pub llm_scores_json: Value,
    pub final_score: f64,
    pub reasons_json: Value,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordKind {
    Primary,
    Secondary,
    SearchQuery,
}

impl KeywordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::SearchQuery => "search_query",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "primary" => Self::Primary,
            "search_query" => Self::SearchQuery,
            _ => Self::Secondary,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRecord {
    pub id: String,
    pub run_id: String,
    /// Absent for run-aggregate rows, present for per-repo rows.
    pub repo_id: Option<String>,
    pub keyword: String,
    pub kind: KeywordKind,
    pub weight: f64,
}

/// Stable keyword row id: hash of run + repo + keyword + kind.
pub fn keyword_id(run_id: &str, repo_id: Option<&str>, keyword: &str, kind: KeywordKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(b"|");
    hasher.update(repo_id.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(keyword.as_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_str().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct NewAnalysis<'a> {
    pub run_id: &'a str,
    pub repo_id: &'a str,
    pub model: &'a str,
    pub prompt_id: &'a str,
    pub prompt_version: &'a str,
    pub input_json: &'a Value,
    pub output_json: &'a Value,
    pub llm_scores_json: &'a Value,
    pub final_score: f64,
    pub reasons_json: &'a Value,
    pub created_at: i64,
}

impl Store {
    /// Insert one analysis row. The UNIQUE (run_id, repo_id) index enforces
    /// at-most-once analysis per repo per run.
    pub fn insert_analysis(&self, new: &NewAnalysis<'_>) -> Result<i64, StoreError> {
        let input = serde_json::to_string(new.input_json)?;
        let output = serde_json::to_string(new.output_json)?;
        let scores = serde_json::to_string(new.llm_scores_json)?;
        let reasons = serde_json::to_string(new.reasons_json)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO analyses \
                 (run_id, repo_id, model, prompt_id, prompt_version, input_json, \
                  output_json, llm_scores_json, final_score, reasons_json, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    new.run_id,
                    new.repo_id,
                    new.model,
                    new.prompt_id,
                    new.prompt_version,
                    input,
                    output,
                    scores,
                    new.final_score,
                    reasons,
                    new.created_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn has_analysis(&self, run_id: &str, repo_id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM analyses WHERE run_id = ?1 AND repo_id = ?2",
                params![run_id, repo_id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    pub fn count_analyses(&self, run_id: &str) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM analyses WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )?)
        })
    }

    /// All analyses for a run, ordered by repo id for deterministic
    /// downstream iteration (grouping, aggregation, replay).
    pub fn analyses_for_run(&self, run_id: &str) -> Result<Vec<AnalysisRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, repo_id, model, prompt_id, prompt_version, input_json, \
                        output_json, llm_scores_json, final_score, reasons_json, created_at \
                 FROM analyses WHERE run_id = ?1 ORDER BY repo_id",
            )?;
            let rows = stmt
                .query_map(params![run_id], map_analysis_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(finish_analysis_row).collect()
        })
    }

    /// Top analyses for a run by final score (desc), repo id as tie-break.
    pub fn top_analyses_for_run(
        &self,
        run_id: &str,
        limit: usize,
    ) -> Result<Vec<AnalysisRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, repo_id, model, prompt_id, prompt_version, input_json, \
                        output_json, llm_scores_json, final_score, reasons_json, created_at \
                 FROM analyses WHERE run_id = ?1 \
                 ORDER BY final_score DESC, repo_id ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![run_id, limit as i64], map_analysis_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(finish_analysis_row).collect()
        })
    }

    /// Highest-scoring analyses from *other* runs, at most one per repo,
    /// excluding repos already named. Used for historical brief injection.
    pub fn top_history_analyses(
        &self,
        exclude_run_id: &str,
        exclude_repos: &[String],
        limit: usize,
    ) -> Result<Vec<AnalysisRecord>, StoreError> {
        let all = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, repo_id, model, prompt_id, prompt_version, input_json, \
                        output_json, llm_scores_json, final_score, reasons_json, created_at \
                 FROM analyses WHERE run_id != ?1 \
                 ORDER BY final_score DESC, repo_id ASC, run_id ASC",
            )?;
            let rows = stmt
                .query_map(params![exclude_run_id], map_analysis_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(finish_analysis_row)
                .collect::<Result<Vec<_>, _>>()
        })?;

        let mut seen: std::collections::HashSet<&str> =
            exclude_repos.iter().map(|s| s.as_str()).collect();
        let mut out = Vec::new();
        for record in &all {
            if out.len() >= limit {
                break;
            }
            if seen.contains(record.repo_id.as_str()) {
                continue;
            }
            seen.insert(record.repo_id.as_str());
            out.push(record.clone());
        }
        Ok(out)
    }

    pub fn get_analysis(
        &self,
        run_id: &str,
        repo_id: &str,
    ) -> Result<Option<AnalysisRecord>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, run_id, repo_id, model, prompt_id, prompt_version, input_json, \
                            output_json, llm_scores_json, final_score, reasons_json, created_at \
                     FROM analyses WHERE run_id = ?1 AND repo_id = ?2",
                    params![run_id, repo_id],
                    map_analysis_row,
                )
                .optional()?;
            row.map(finish_analysis_row).transpose()
        })
    }

    pub fn upsert_keyword(&self, record: &KeywordRecord) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO keywords (id, run_id, repo_id, keyword, kind, weight) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(id) DO UPDATE SET weight = excluded.weight",
                params![
                    record.id,
                    record.run_id,
                    record.repo_id,
                    record.keyword,
                    record.kind.as_str(),
                    record.weight,
                ],
            )?;
            Ok(())
        })
    }

    /// Per-repo keyword rows for a run, ordered by repo then kind then term.
    pub fn repo_keywords_for_run(&self, run_id: &str) -> Result<Vec<KeywordRecord>, StoreError> {
        self.keywords_query(
            "SELECT id, run_id, repo_id, keyword, kind, weight FROM keywords \
             WHERE run_id = ?1 AND repo_id IS NOT NULL \
             ORDER BY repo_id, kind, keyword",
            run_id,
        )
    }

    /// Run-aggregate keyword rows (repo absent), heaviest first.
    pub fn aggregate_keywords_for_run(
        &self,
        run_id: &str,
    ) -> Result<Vec<KeywordRecord>, StoreError> {
        self.keywords_query(
            "SELECT id, run_id, repo_id, keyword, kind, weight FROM keywords \
             WHERE run_id = ?1 AND repo_id IS NULL \
             ORDER BY weight DESC, keyword ASC",
            run_id,
        )
    }

    fn keywords_query(&self, sql: &str, run_id: &str) -> Result<Vec<KeywordRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params![run_id], |row| {
                    Ok(KeywordRecord {
                        id: row.get(0)?,
                        run_id: row.get(1)?,
                        repo_id: row.get(2)?,
                        keyword: row.get(3)?,
                        kind: KeywordKind::from_str(&row.get::<_, String>(4)?),
                        weight: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

type AnalysisRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    f64,
    String,
    i64,
);

fn map_analysis_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnalysisRow> {
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
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn finish_analysis_row(row: AnalysisRow) -> Result<AnalysisRecord, StoreError> {
    let (
        id,
        run_id,
        repo_id,
        model,
        prompt_id,
        prompt_version,
        input,
        output,
        scores,
        final_score,
        reasons,
        created_at,
    ) = row;
    Ok(AnalysisRecord {
        id,
        run_id,
        repo_id,
        model,
        prompt_id,
        prompt_version,
        input_json: serde_json::from_str(&input)?,
        output_json: serde_json::from_str(&output)?,
        llm_scores_json: serde_json::from_str(&scores)?,
        final_score,
        reasons_json: serde_json::from_str(&reasons)?,
        created_at,
    })
}
