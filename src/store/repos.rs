//! Repositories, READMEs, search queries and query-result links.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Store, StoreError};

/// A discovered repository, keyed by canonical `owner/name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRecord {
    pub full_name: String,
    pub stars: i64,
    pub forks: i64,
    pub topics: Vec<String>,
    pub language: Option<String>,
    pub license: Option<String>,
    pub pushed_at: Option<String>,
    pub archived: bool,
    pub fork: bool,
    pub last_seen_run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadmeRecord {
    pub repo_id: String,
    pub content: Vec<u8>,
    pub content_sha256: String,
    pub fetched_at: i64,
    pub etag: Option<String>,
    pub source_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubQueryRecord {
    pub id: i64,
    pub run_id: String,
    pub pass: i64,
    pub query: String,
    pub params_json: Value,
}

impl Store {
    /// Upsert by canonical full name, refreshing metadata and the
    /// most-recent-seen run.
    pub fn upsert_repo(&self, repo: &RepoRecord) -> Result<(), StoreError> {
        let topics = serde_json::to_string(&repo.topics)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO repos \
                 (full_name, stars, forks, topics_json, language, license, pushed_at, \
                  archived, fork, last_seen_run_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT(full_name) DO UPDATE SET \
                   stars = excluded.stars, \
                   forks = excluded.forks, \
                   topics_json = excluded.topics_json, \
                   language = excluded.language, \
                   license = excluded.license, \
                   pushed_at = excluded.pushed_at, \
                   archived = excluded.archived, \
                   fork = excluded.fork, \
                   last_seen_run_id = excluded.last_seen_run_id",
                params![
                    repo.full_name,
                    repo.stars,
                    repo.forks,
                    topics,
                    repo.language,
                    repo.license,
                    repo.pushed_at,
                    repo.archived as i64,
                    repo.fork as i64,
                    repo.last_seen_run_id,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_repo(&self, full_name: &str) -> Result<Option<RepoRecord>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT full_name, stars, forks, topics_json, language, license, \
                            pushed_at, archived, fork, last_seen_run_id \
                     FROM repos WHERE full_name = ?1",
                    params![full_name],
                    map_repo_row,
                )
                .optional()?;
            row.map(finish_repo_row).transpose()
        })
    }

    pub fn repos_by_names(&self, names: &[String]) -> Result<Vec<RepoRecord>, StoreError> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(repo) = self.get_repo(name)? {
                out.push(repo);
            }
        }
        Ok(out)
    }

    pub fn count_repos(&self) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM repos", [], |row| row.get(0))?)
        })
    }

    pub fn insert_github_query(
        &self,
        run_id: &str,
        pass: i64,
        query: &str,
        params_json: &Value,
    ) -> Result<i64, StoreError> {
        let params_json = serde_json::to_string(params_json)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO github_queries (run_id, pass, query, params_json) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![run_id, pass, query, params_json],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn queries_for_run(&self, run_id: &str) -> Result<Vec<GithubQueryRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, pass, query, params_json \
                 FROM github_queries WHERE run_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![run_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(id, run_id, pass, query, params_json)| {
                    Ok(GithubQueryRecord {
                        id,
                        run_id,
                        pass,
                        query,
                        params_json: serde_json::from_str(&params_json)?,
                    })
                })
                .collect()
        })
    }

    /// Record that `repo_id` was returned by `query_id` at `rank`.
    pub fn link_repo_query(
        &self,
        query_id: i64,
        repo_id: &str,
        rank: i64,
        pass: i64,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO repo_queries (query_id, repo_id, rank, pass) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![query_id, repo_id, rank, pass],
            )?;
            Ok(())
        })
    }

    /// Replace-in-place: at most one current README per repository.
    pub fn upsert_readme(&self, readme: &ReadmeRecord) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO readmes (repo_id, content, content_sha256, fetched_at, etag, source_url) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(repo_id) DO UPDATE SET \
                   content = excluded.content, \
                   content_sha256 = excluded.content_sha256, \
                   fetched_at = excluded.fetched_at, \
                   etag = excluded.etag, \
                   source_url = excluded.source_url",
                params![
                    readme.repo_id,
                    readme.content,
                    readme.content_sha256,
                    readme.fetched_at,
                    readme.etag,
                    readme.source_url,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_readme(&self, repo_id: &str) -> Result<Option<ReadmeRecord>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT repo_id, content, content_sha256, fetched_at, etag, source_url \
                     FROM readmes WHERE repo_id = ?1",
                    params![repo_id],
                    |row| {
                        Ok(ReadmeRecord {
                            repo_id: row.get(0)?,
                            content: row.get(1)?,
                            content_sha256: row.get(2)?,
                            fetched_at: row.get(3)?,
                            etag: row.get(4)?,
                            source_url: row.get(5)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    pub fn has_readme(&self, repo_id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM readmes WHERE repo_id = ?1",
                params![repo_id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }
}

type RepoRow = (
    String,
    i64,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
    i64,
    String,
);

fn map_repo_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RepoRow> {
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
    ))
}

fn finish_repo_row(row: RepoRow) -> Result<RepoRecord, StoreError> {
    let (full_name, stars, forks, topics, language, license, pushed_at, archived, fork, run_id) =
        row;
    Ok(RepoRecord {
        full_name,
        stars,
        forks,
        topics: serde_json::from_str(&topics)?,
        language,
        license,
        pushed_at,
        archived: archived != 0,
        fork: fork != 0,
        last_seen_run_id: run_id,
    })
}
