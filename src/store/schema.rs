//! Ordered, append-only schema migration scripts.
//!
//! Scripts are applied in order by `Store::migrate` and recorded in
//! `schema_migrations` by name. Never edit an existing script; add a new one.

pub(crate) const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_core_tables",
        "CREATE TABLE runs (
           id TEXT PRIMARY KEY,
           created_at INTEGER NOT NULL,
           args_json TEXT NOT NULL,
           config_hash TEXT NOT NULL,
           git_commit TEXT
         );
         CREATE TABLE steps (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           run_id TEXT NOT NULL REFERENCES runs(id),
           name TEXT NOT NULL,
           started_at INTEGER NOT NULL,
           finished_at INTEGER,
           status TEXT,
           stats_json TEXT
         );
         CREATE INDEX idx_steps_run ON steps(run_id);
         CREATE TABLE audit_log (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           run_id TEXT NOT NULL REFERENCES runs(id),
           ts INTEGER NOT NULL,
           level TEXT NOT NULL,
           scope TEXT NOT NULL,
           event TEXT NOT NULL,
           message TEXT NOT NULL,
           data_json TEXT NOT NULL
         );
         CREATE INDEX idx_audit_run ON audit_log(run_id);
         CREATE INDEX idx_audit_event ON audit_log(event);",
    ),
    (
        "0002_discovery_tables",
        "CREATE TABLE github_queries (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           run_id TEXT NOT NULL REFERENCES runs(id),
           pass INTEGER NOT NULL CHECK (pass IN (1, 2)),
           query TEXT NOT NULL,
           params_json TEXT NOT NULL
         );
         CREATE INDEX idx_queries_run ON github_queries(run_id);
         CREATE TABLE repos (
           full_name TEXT PRIMARY KEY,
           stars INTEGER NOT NULL DEFAULT 0,
           forks INTEGER NOT NULL DEFAULT 0,
           topics_json TEXT NOT NULL DEFAULT '[]',
           language TEXT,
           license TEXT,
           pushed_at TEXT,
           archived INTEGER NOT NULL DEFAULT 0,
           fork INTEGER NOT NULL DEFAULT 0,
           last_seen_run_id TEXT NOT NULL REFERENCES runs(id)
         );
         CREATE TABLE readmes (
           repo_id TEXT PRIMARY KEY REFERENCES repos(full_name),
           content BLOB NOT NULL,
           content_sha256 TEXT NOT NULL,
           fetched_at INTEGER NOT NULL,
           etag TEXT,
           source_url TEXT NOT NULL
         );
         CREATE TABLE repo_queries (
           query_id INTEGER NOT NULL REFERENCES github_queries(id),
           repo_id TEXT NOT NULL REFERENCES repos(full_name),
           rank INTEGER NOT NULL,
           pass INTEGER NOT NULL,
           PRIMARY KEY (query_id, repo_id)
         );",
    ),
    (
        "0003_analysis_tables",
        "CREATE TABLE analyses (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           run_id TEXT NOT NULL REFERENCES runs(id),
           repo_id TEXT NOT NULL REFERENCES repos(full_name),
           model TEXT NOT NULL,
           prompt_id TEXT NOT NULL,
           prompt_version TEXT NOT NULL,
           input_json TEXT NOT NULL,
           output_json TEXT NOT NULL,
           llm_scores_json TEXT NOT NULL,
           final_score REAL NOT NULL,
           reasons_json TEXT NOT NULL,
           created_at INTEGER NOT NULL,
           UNIQUE (run_id, repo_id)
         );
         CREATE INDEX idx_analyses_run ON analyses(run_id);
         CREATE TABLE keywords (
           id TEXT PRIMARY KEY,
           run_id TEXT NOT NULL REFERENCES runs(id),
           repo_id TEXT REFERENCES repos(full_name),
           keyword TEXT NOT NULL,
           kind TEXT NOT NULL CHECK (kind IN ('primary', 'secondary', 'search_query')),
           weight REAL NOT NULL
         );
         CREATE INDEX idx_keywords_run ON keywords(run_id);",
    ),
    (
        "0004_briefs",
        "CREATE TABLE briefs (
           id TEXT PRIMARY KEY,
           run_id TEXT NOT NULL REFERENCES runs(id),
           score REAL NOT NULL,
           repo_ids_json TEXT NOT NULL,
           content_json TEXT NOT NULL,
           markdown TEXT NOT NULL,
           outreach_md TEXT NOT NULL,
           status TEXT NOT NULL,
           created_at INTEGER NOT NULL
         );
         CREATE INDEX idx_briefs_run ON briefs(run_id);",
    ),
    (
        "0005_http_cache",
        "CREATE TABLE http_cache (
           key TEXT PRIMARY KEY,
           method TEXT NOT NULL,
           url TEXT NOT NULL,
           status INTEGER NOT NULL,
           etag TEXT,
           last_modified TEXT,
           body BLOB NOT NULL,
           fetched_at INTEGER NOT NULL,
           expires_at INTEGER
         );",
    ),
    (
        "0006_rate_limit_snapshots",
        "CREATE TABLE rate_limit_snapshots (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           run_id TEXT NOT NULL REFERENCES runs(id),
           taken_at INTEGER NOT NULL,
           search_limit INTEGER NOT NULL,
           search_remaining INTEGER NOT NULL,
           search_reset INTEGER NOT NULL,
           core_limit INTEGER NOT NULL,
           core_remaining INTEGER NOT NULL,
           core_reset INTEGER NOT NULL
         );",
    ),
];
