//! Run lifecycle and audit sink.
//!
//! One `RunOrchestrator` per invocation. Correlation is explicit: the
//! orchestrator value is passed through the pipeline, never held in
//! process-global state, so a second concurrent run would be additive.

use std::path::Path;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::redact::redact;
use crate::store::now_epoch_ms;
use crate::store::runs::{Run, StepStatus};
use crate::store::{Store, StoreError};

/// Canonical step names. Closed set; the store only ever sees these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepName {
    InitRun,
    GithubRateLimitSnapshot,
    GithubSearchPass1,
    HydrateRepoMetadata,
    HydrateReadme,
    LlmRepoAnalysis,
    KeywordAggregate,
    GithubSearchPass2,
    LlmBriefGenerate,
    ExportMarkdown,
}

impl StepName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitRun => "init_run",
            Self::GithubRateLimitSnapshot => "github_rate_limit_snapshot",
            Self::GithubSearchPass1 => "github_search_pass1",
            Self::HydrateRepoMetadata => "hydrate_repo_metadata",
            Self::HydrateReadme => "hydrate_readme",
            Self::LlmRepoAnalysis => "llm_repo_analysis",
            Self::KeywordAggregate => "keyword_aggregate",
            Self::GithubSearchPass2 => "github_search_pass2",
            Self::LlmBriefGenerate => "llm_brief_generate",
            Self::ExportMarkdown => "export_markdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl AuditLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

pub struct RunOrchestrator {
    store: Store,
    run_id: String,
}

impl RunOrchestrator {
    /// Create the run row: UUID id, redacted argument snapshot, config hash,
    /// git commit when discoverable.
    pub fn create(store: Store, args: &Value, config_hash: &str) -> Result<Self, StoreError> {
        let run_id = Uuid::new_v4().to_string();
        let run = Run {
            id: run_id.clone(),
            created_at: now_epoch_ms(),
            args_json: redact(args),
            config_hash: config_hash.to_string(),
            git_commit: discover_git_commit(Path::new(".")),
        };
        store.insert_run(&run)?;
        let orchestrator = Self { store, run_id };
        orchestrator.log_audit(
            AuditLevel::Info,
            StepName::InitRun.as_str(),
            "run.created",
            "run created",
            json!({ "config_hash": config_hash }),
        )?;
        Ok(orchestrator)
    }

    /// Attach to an existing run (scout:expand, briefs:generate, replay).
    pub fn attach(store: Store, run_id: &str) -> Result<Self, StoreError> {
        store.get_run(run_id)?;
        Ok(Self {
            store,
            run_id: run_id.to_string(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn start_step(&self, name: StepName) -> Result<StepHandle, StoreError> {
        let started_at = now_epoch_ms();
        let step_id = self.store.start_step(&self.run_id, name.as_str(), started_at)?;
        self.log_audit(
            AuditLevel::Info,
            name.as_str(),
            "step.started",
            name.as_str(),
            json!({}),
        )?;
        Ok(StepHandle {
            store: self.store.clone(),
            run_id: self.run_id.clone(),
            step_id,
            name,
            started_at,
        })
    }

    /// Redact, stamp the run id, write the audit row, mirror to tracing.
    pub fn log_audit(
        &self,
        level: AuditLevel,
        scope: &str,
        event: &str,
        message: &str,
        data: Value,
    ) -> Result<(), StoreError> {
        let data = redact(&data);
        match level {
            AuditLevel::Debug => tracing::debug!(run_id = %self.run_id, scope, event, "{message}"),
            AuditLevel::Info => tracing::info!(run_id = %self.run_id, scope, event, "{message}"),
            AuditLevel::Warn => tracing::warn!(run_id = %self.run_id, scope, event, "{message}"),
            AuditLevel::Error => tracing::error!(run_id = %self.run_id, scope, event, "{message}"),
        }
        self.store.insert_audit(
            &self.run_id,
            now_epoch_ms(),
            level.as_str(),
            scope,
            event,
            message,
            &data,
        )
    }
}

/// A started step. Finalize exactly once via `finish`.
pub struct StepHandle {
    store: Store,
    run_id: String,
    step_id: i64,
    name: StepName,
    started_at: i64,
}

impl StepHandle {
    pub fn name(&self) -> StepName {
        self.name
    }

    pub fn finish(self, status: StepStatus, stats: Value) -> Result<(), StoreError> {
        let finished_at = now_epoch_ms();
        let mut stats = match stats {
            Value::Object(map) => Value::Object(map),
            other => json!({ "value": other }),
        };
        stats["duration_ms"] = json!(finished_at - self.started_at);
        let stats = redact(&stats);

        self.store
            .finish_step(self.step_id, finished_at, status, &stats)?;

        let event = match status {
            StepStatus::Failed => "step.failed",
            _ => "step.finished",
        };
        let level = match status {
            StepStatus::Failed => "error",
            _ => "info",
        };
        self.store.insert_audit(
            &self.run_id,
            finished_at,
            level,
            self.name.as_str(),
            event,
            self.name.as_str(),
            &stats,
        )
    }
}

/// Best-effort current commit hash: follow `.git/HEAD` one level.
fn discover_git_commit(root: &Path) -> Option<String> {
    let head = std::fs::read_to_string(root.join(".git/HEAD")).ok()?;
    let head = head.trim();
    if let Some(reference) = head.strip_prefix("ref: ") {
        let hash = std::fs::read_to_string(root.join(".git").join(reference)).ok()?;
        let hash = hash.trim().to_string();
        (!hash.is_empty()).then_some(hash)
    } else if head.len() >= 7 && head.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(head.to_string())
    } else {
        None
    }
}
