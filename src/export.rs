//! Markdown export of a run's briefs.
//!
//! Layout: `out/index.md`, `out/briefs/{id}.md`, `out/briefs/{id}_outreach.md`
//! and `out/TOP_OPPORTUNITY_{n}.md` for the top shortlisted briefs. Brief
//! markdown is rendered at generation time; export writes stored content
//! only, so no secret can reach disk that was not already redacted.

use std::path::Path;

use serde::Serialize;
use serde_json::{json, Value};

use crate::briefs::MANUAL_REVIEW_BANNER;
use crate::redact::redact;
use crate::store::briefs::{BriefRecord, BriefStatus};
use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub run_id: String,
    pub briefs_exported: usize,
    pub top_opportunities: usize,
    pub out_dir: String,
}

/// Write the export tree for a run. Returns counts for the CLI summary.
pub fn export_run(
    store: &Store,
    run_id: &str,
    out_dir: impl AsRef<Path>,
    top_opportunities: usize,
) -> Result<ExportSummary, ExportError> {
    let out_dir = out_dir.as_ref();
    let briefs_dir = out_dir.join("briefs");
    std::fs::create_dir_all(&briefs_dir)?;

    // Already sorted by score descending.
    let briefs = store.briefs_for_run(run_id)?;

    let mut index = String::new();
    index.push_str(&format!("> {MANUAL_REVIEW_BANNER}\n\n"));
    index.push_str(&format!("# Collaboration briefs for run {run_id}\n\n"));

    for brief in &briefs {
        std::fs::write(briefs_dir.join(format!("{}.md", brief.id)), &brief.markdown)?;
        std::fs::write(
            briefs_dir.join(format!("{}_outreach.md", brief.id)),
            &brief.outreach_md,
        )?;
        index.push_str(&format!(
            "- [{}](briefs/{}.md): score {:.6}, status {}, repos: {}\n",
            brief.id,
            brief.id,
            brief.score,
            brief.status.as_str(),
            brief.repo_ids.join(", "),
        ));
    }
    std::fs::write(out_dir.join("index.md"), index)?;

    let shortlisted: Vec<&BriefRecord> = briefs
        .iter()
        .filter(|b| b.status == BriefStatus::Shortlisted)
        .take(top_opportunities)
        .collect();
    for (position, brief) in shortlisted.iter().enumerate() {
        let path = out_dir.join(format!("TOP_OPPORTUNITY_{}.md", position + 1));
        let body = format!("> {MANUAL_REVIEW_BANNER}\n\n{}", brief.markdown);
        std::fs::write(path, body)?;
    }

    Ok(ExportSummary {
        run_id: run_id.to_string(),
        briefs_exported: briefs.len(),
        top_opportunities: shortlisted.len(),
        out_dir: out_dir.display().to_string(),
    })
}

/// Assemble the full debug bundle for a run. Redacted defensively even
/// though stored rows already are.
pub fn dump_run(store: &Store, run_id: &str) -> Result<Value, ExportError> {
    let run = store.get_run(run_id)?;
    let steps = store.steps_for_run(run_id)?;
    let queries = store.queries_for_run(run_id)?;
    let analyses = store.analyses_for_run(run_id)?;
    let briefs = store.briefs_for_run(run_id)?;
    let audit = store.audit_for_run(run_id)?;

    let bundle = json!({
        "run_id": run_id,
        "run": run,
        "steps": steps,
        "queries": queries,
        "analyses": analyses,
        "briefs": briefs,
        "audit_log": audit,
    });
    Ok(redact(&bundle))
}
