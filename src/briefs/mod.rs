//! Brief engine: candidate grouping, competitor filtering, LLM synthesis,
//! deterministic scoring and the threshold gate.

pub mod overlap;
pub mod scoring;

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::llm::prompts::{PromptError, PromptRegistry, BRIEF_GENERATE_ID, DEFAULT_VERSION};
use crate::llm::schema::{validate_brief, BriefOutput, RepoAnalysisOutput};
use crate::llm::{LlmClient, LlmError, LlmRequest, Message};
use crate::orchestrator::{AuditLevel, RunOrchestrator, StepName};
use crate::store::analysis::AnalysisRecord;
use crate::store::briefs::{BriefRecord, BriefStatus};
use crate::store::now_epoch_ms;
use crate::store::repos::RepoRecord;
use crate::store::runs::StepStatus;
use crate::store::{Store, StoreError};

use overlap::{candidate_overlap_score, filter_pair, FunctionSignature};
use scoring::{round6, ScoringError, ScoringPolicy};

/// Banner every outreach draft and export leads with.
pub const MANUAL_REVIEW_BANNER: &str =
    "Manual review required. This tool does not post automatically.";

pub const DEFAULT_MAX_COMBOS: usize = 200;
pub const DEFAULT_MAX_BRIEFS: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum BriefsError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),
    #[error("prompt error: {0}")]
    Prompt(#[from] PromptError),
    #[error("scoring error: {0}")]
    Scoring(#[from] ScoringError),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

// =============================================================================
// Parameters
// =============================================================================

#[derive(Debug, Clone)]
pub struct BriefParams {
    pub min_repo_score: f64,
    pub min_collab_potential: f64,
    pub min_brief_score: f64,
    pub max_combos: usize,
    pub max_briefs: usize,
    pub overlap_threshold: f64,
    pub overlap_exception_penalty: f64,
    pub history_candidates: usize,
    pub include_triples: bool,
    /// The user's own repo is exempt from anchor dedup.
    pub own_repo: Option<String>,
    pub model: String,
}

impl BriefParams {
    pub fn from_policy(policy: &ScoringPolicy, model: impl Into<String>) -> Self {
        Self {
            min_repo_score: policy.thresholds.min_repo_score_for_brief,
            min_collab_potential: policy.thresholds.min_collaboration_potential_for_brief,
            min_brief_score: policy.thresholds.min_brief_score,
            max_combos: DEFAULT_MAX_COMBOS,
            max_briefs: DEFAULT_MAX_BRIEFS,
            overlap_threshold: 0.70,
            overlap_exception_penalty: 0.10,
            history_candidates: 100,
            include_triples: false,
            own_repo: None,
            model: model.into(),
        }
    }
}

// =============================================================================
// Candidate pool
// =============================================================================

/// One analyzed repo, hydrated for grouping.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub repo_id: String,
    pub stars: i64,
    pub language: Option<String>,
    pub license: Option<String>,
    pub topics: BTreeSet<String>,
    pub final_score: f64,
    pub collaboration_potential: f64,
    pub output: RepoAnalysisOutput,
    pub signature: FunctionSignature,
}

impl PoolEntry {
    pub fn from_analysis(
        record: &AnalysisRecord,
        repo: Option<&RepoRecord>,
    ) -> Result<Self, serde_json::Error> {
        let output: RepoAnalysisOutput = serde_json::from_value(record.output_json.clone())?;
        let collaboration_potential = output.scores.collaboration_potential;
        let signature = FunctionSignature::from_output(&output);
        Ok(Self {
            repo_id: record.repo_id.clone(),
            stars: repo.map(|r| r.stars).unwrap_or_default(),
            language: repo.and_then(|r| r.language.clone()),
            license: repo.and_then(|r| r.license.clone()),
            topics: repo
                .map(|r| r.topics.iter().map(|t| t.to_lowercase()).collect())
                .unwrap_or_default(),
            final_score: record.final_score,
            collaboration_potential,
            output,
            signature,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateGroup {
    /// Sorted canonical repo ids, length 2 or 3.
    pub repo_ids: Vec<String>,
    pub overlap_score: f64,
}

/// Deterministic candidate enumeration: qualified entries sorted by repo id,
/// all unordered pairs (then triples when configured) up to `max_combos`,
/// ranked by overlap score descending with the joined id string as
/// tie-break.
pub fn candidate_groups(
    pool: &[PoolEntry],
    min_repo_score: f64,
    min_collab_potential: f64,
    max_combos: usize,
    include_triples: bool,
) -> Vec<CandidateGroup> {
    let mut qualified: Vec<&PoolEntry> = pool
        .iter()
        .filter(|e| {
            e.final_score >= min_repo_score && e.collaboration_potential >= min_collab_potential
        })
        .collect();
    qualified.sort_by(|a, b| a.repo_id.cmp(&b.repo_id));

    let mut groups: Vec<CandidateGroup> = Vec::new();

    'pairs: for i in 0..qualified.len() {
        for j in (i + 1)..qualified.len() {
            if groups.len() >= max_combos {
                break 'pairs;
            }
            let (a, b) = (qualified[i], qualified[j]);
            let score = pair_score(a, b);
            groups.push(CandidateGroup {
                repo_ids: vec![a.repo_id.clone(), b.repo_id.clone()],
                overlap_score: score,
            });
        }
    }

    if include_triples {
        'triples: for i in 0..qualified.len() {
            for j in (i + 1)..qualified.len() {
                for k in (j + 1)..qualified.len() {
                    if groups.len() >= max_combos {
                        break 'triples;
                    }
                    let (a, b, c) = (qualified[i], qualified[j], qualified[k]);
                    let score = round6(
                        (pair_score(a, b) + pair_score(a, c) + pair_score(b, c)) / 3.0,
                    );
                    groups.push(CandidateGroup {
                        repo_ids: vec![
                            a.repo_id.clone(),
                            b.repo_id.clone(),
                            c.repo_id.clone(),
                        ],
                        overlap_score: score,
                    });
                }
            }
        }
    }

    groups.sort_by(|a, b| {
        b.overlap_score
            .partial_cmp(&a.overlap_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.repo_ids.join(",").cmp(&b.repo_ids.join(",")))
    });
    groups
}

fn pair_score(a: &PoolEntry, b: &PoolEntry) -> f64 {
    candidate_overlap_score(
        &a.topics,
        &b.topics,
        a.language.as_deref(),
        b.language.as_deref(),
        &a.signature,
        &b.signature,
    )
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct BriefsSummary {
    pub run_id: String,
    pub pool_size: usize,
    pub candidates: usize,
    pub generated: usize,
    pub shortlisted: usize,
    pub rejected_by_threshold: usize,
    pub rejected_pairs: usize,
    pub skipped_anchor_dedup: usize,
    pub failed: usize,
}

pub struct BriefEngine<'a> {
    pub store: &'a Store,
    pub llm: &'a LlmClient,
    pub prompts: &'a PromptRegistry,
    pub policy: &'a ScoringPolicy,
    pub orchestrator: &'a RunOrchestrator,
}

impl<'a> BriefEngine<'a> {
    pub async fn generate(&self, params: &BriefParams) -> Result<BriefsSummary, BriefsError> {
        let step = self.orchestrator.start_step(StepName::LlmBriefGenerate)?;
        match self.generate_inner(params).await {
            Ok(summary) => {
                step.finish(
                    StepStatus::Success,
                    json!({
                        "generated": summary.generated,
                        "shortlisted": summary.shortlisted,
                        "failed": summary.failed,
                    }),
                )?;
                Ok(summary)
            }
            Err(err) => {
                step.finish(StepStatus::Failed, json!({ "error": err.to_string() }))?;
                Err(err)
            }
        }
    }

    async fn generate_inner(&self, params: &BriefParams) -> Result<BriefsSummary, BriefsError> {
        let run_id = self.orchestrator.run_id().to_string();
        let pool = self.build_pool(&run_id, params.history_candidates)?;

        let candidates = candidate_groups(
            &pool,
            params.min_repo_score,
            params.min_collab_potential,
            params.max_combos,
            params.include_triples,
        );

        let mut summary = BriefsSummary {
            run_id: run_id.clone(),
            pool_size: pool.len(),
            candidates: candidates.len(),
            generated: 0,
            shortlisted: 0,
            rejected_by_threshold: 0,
            rejected_pairs: 0,
            skipped_anchor_dedup: 0,
            failed: 0,
        };

        let mut anchored: HashSet<String> = HashSet::new();

        for group in &candidates {
            if summary.generated >= params.max_briefs {
                break;
            }
            if group.repo_ids.iter().any(|id| anchored.contains(id)) {
                summary.skipped_anchor_dedup += 1;
                continue;
            }

            let entries: Vec<&PoolEntry> = group
                .repo_ids
                .iter()
                .filter_map(|id| pool.iter().find(|e| &e.repo_id == id))
                .collect();
            if entries.len() != group.repo_ids.len() {
                continue;
            }

            let Some(penalty) = self.filter_group(&entries, params)? else {
                summary.rejected_pairs += 1;
                continue;
            };

            match self.synthesize(&entries, group, penalty, params).await {
                Ok(status) => {
                    summary.generated += 1;
                    match status {
                        BriefStatus::Shortlisted => {
                            summary.shortlisted += 1;
                            for id in &group.repo_ids {
                                if params.own_repo.as_deref() != Some(id.as_str()) {
                                    anchored.insert(id.clone());
                                }
                            }
                        }
                        _ => summary.rejected_by_threshold += 1,
                    }
                }
                Err(SynthesisFailure::Invalid(message)) => {
                    self.orchestrator.log_audit(
                        AuditLevel::Error,
                        StepName::LlmBriefGenerate.as_str(),
                        "llm.output.invalid_json",
                        &group.repo_ids.join(","),
                        json!({ "repos": group.repo_ids, "error": message }),
                    )?;
                    summary.failed += 1;
                }
                Err(SynthesisFailure::Call(err)) => {
                    self.orchestrator.log_audit(
                        AuditLevel::Error,
                        StepName::LlmBriefGenerate.as_str(),
                        "llm.call.failed",
                        &group.repo_ids.join(","),
                        json!({ "repos": group.repo_ids, "error": err.to_string() }),
                    )?;
                    summary.failed += 1;
                }
                Err(SynthesisFailure::Fatal(err)) => return Err(err),
            }
        }

        Ok(summary)
    }

    /// Assemble the pool: this run's analyses plus historical injection.
    fn build_pool(
        &self,
        run_id: &str,
        history_candidates: usize,
    ) -> Result<Vec<PoolEntry>, BriefsError> {
        let analyses = self.store.analyses_for_run(run_id)?;
        let current_repos: Vec<String> = analyses.iter().map(|a| a.repo_id.clone()).collect();

        let mut pool = Vec::with_capacity(analyses.len());
        for record in &analyses {
            let repo = self.store.get_repo(&record.repo_id)?;
            pool.push(PoolEntry::from_analysis(record, repo.as_ref())?);
        }

        if history_candidates > 0 {
            let injected =
                self.store
                    .top_history_analyses(run_id, &current_repos, history_candidates)?;
            let count = injected.len();
            for record in &injected {
                let repo = self.store.get_repo(&record.repo_id)?;
                pool.push(PoolEntry::from_analysis(record, repo.as_ref())?);
            }
            self.orchestrator.log_audit(
                AuditLevel::Info,
                StepName::LlmBriefGenerate.as_str(),
                "briefs.history.injected",
                "historical analyses injected into pool",
                json!({ "count": count }),
            )?;
        }

        Ok(pool)
    }

    /// Run the competitor filter over every internal pair. `Ok(None)` means
    /// the group is rejected; `Ok(Some(penalty))` carries the worst penalty.
    fn filter_group(
        &self,
        entries: &[&PoolEntry],
        params: &BriefParams,
    ) -> Result<Option<f64>, BriefsError> {
        let mut penalty: f64 = 0.0;
        for i in 0..entries.len() {
            for j in (i + 1)..entries.len() {
                let outcome = filter_pair(
                    &entries[i].signature,
                    &entries[j].signature,
                    params.overlap_threshold,
                    params.overlap_exception_penalty,
                );
                if outcome.rejected {
                    self.orchestrator.log_audit(
                        AuditLevel::Info,
                        StepName::LlmBriefGenerate.as_str(),
                        "briefs.pair_rejected_overlap",
                        "functional competitors",
                        json!({
                            "repos": [&entries[i].repo_id, &entries[j].repo_id],
                            "functional_overlap": outcome.functional_overlap,
                        }),
                    )?;
                    return Ok(None);
                }
                if outcome.exception_triggered {
                    self.orchestrator.log_audit(
                        AuditLevel::Info,
                        StepName::LlmBriefGenerate.as_str(),
                        "briefs.pair_allowed_exception",
                        "interop exception",
                        json!({
                            "repos": [&entries[i].repo_id, &entries[j].repo_id],
                            "functional_overlap": outcome.functional_overlap,
                            "reason": outcome.exception_reason,
                            "penalty": outcome.penalty_applied,
                        }),
                    )?;
                    penalty = penalty.max(outcome.penalty_applied);
                }
            }
        }
        Ok(Some(penalty))
    }

    async fn synthesize(
        &self,
        entries: &[&PoolEntry],
        group: &CandidateGroup,
        penalty: f64,
        params: &BriefParams,
    ) -> Result<BriefStatus, SynthesisFailure> {
        let template = self
            .prompts
            .get(BRIEF_GENERATE_ID, DEFAULT_VERSION)
            .map_err(|e| SynthesisFailure::Fatal(e.into()))?;

        let digest = repos_digest(entries);
        let digest_text = serde_json::to_string_pretty(&digest)
            .map_err(|e| SynthesisFailure::Fatal(e.into()))?;
        let rendered = template.render(&[("repos_json", digest_text.as_str())]);

        let request = LlmRequest::new(&params.model, vec![Message::user(rendered)])
            .temperature(template.temperature)
            .max_tokens(template.max_tokens);

        let output: BriefOutput = self
            .llm
            .chat_validated(&request, validate_brief)
            .await
            .map_err(|err| match err {
                LlmError::InvalidOutput { message } => SynthesisFailure::Invalid(message),
                other => SynthesisFailure::Call(other),
            })?;

        let avg_final =
            entries.iter().map(|e| e.final_score).sum::<f64>() / entries.len() as f64;
        let avg_collab = entries
            .iter()
            .map(|e| e.collaboration_potential)
            .sum::<f64>()
            / entries.len() as f64;
        // Penalty is taken out of the overlap component and the difference
        // floored at zero before weighting.
        let overlap_component = (group.overlap_score - penalty).max(0.0);
        let brief_score = round6(0.4 * avg_final + 0.4 * avg_collab + 0.2 * overlap_component);

        let status = if brief_score >= params.min_brief_score {
            BriefStatus::Shortlisted
        } else {
            BriefStatus::RejectedByThreshold
        };

        let markdown = render_brief_markdown(&output, brief_score);
        let outreach_md = format!("> {MANUAL_REVIEW_BANNER}\n\n{}\n", output.outreach_message);

        let content_json = json!({
            "brief": serde_json::to_value(&output).map_err(|e| SynthesisFailure::Fatal(e.into()))?,
            "overlap_score": group.overlap_score,
            "penalty": penalty,
            "avg_final_score": round6(avg_final),
            "avg_collaboration_potential": round6(avg_collab),
            "policy_version": self.policy.version,
        });

        self.store
            .insert_brief(&BriefRecord {
                id: Uuid::new_v4().to_string(),
                run_id: self.orchestrator.run_id().to_string(),
                score: brief_score,
                repo_ids: group.repo_ids.clone(),
                content_json,
                markdown,
                outreach_md,
                status,
                created_at: now_epoch_ms(),
            })
            .map_err(|e| SynthesisFailure::Fatal(e.into()))?;

        Ok(status)
    }
}

enum SynthesisFailure {
    Invalid(String),
    Call(LlmError),
    Fatal(BriefsError),
}

/// Compact deterministic JSON description of the grouped repos, in group
/// order (already sorted by id).
fn repos_digest(entries: &[&PoolEntry]) -> Value {
    Value::Array(
        entries
            .iter()
            .map(|e| {
                json!({
                    "full_name": e.repo_id,
                    "stars": e.stars,
                    "language": e.language,
                    "topics": e.topics.iter().collect::<Vec<_>>(),
                    "license": e.license,
                    "problem_summary": e.output.signals.problem_summary,
                    "who_is_it_for": e.output.signals.who_is_it_for,
                    "integration_surface": e.output.signals.integration_surface,
                    "final_score": e.final_score,
                })
            })
            .collect(),
    )
}

fn render_brief_markdown(output: &BriefOutput, score: f64) -> String {
    let mut md = String::new();
    md.push_str(&format!("> Score: {score:.6}\n\n"));
    md.push_str(&format!("# {}\n\n", output.title));
    md.push_str(&format!("{}\n\n", output.concept));
    md.push_str("## Repositories\n\n");
    for repo in &output.repos {
        md.push_str(&format!(
            "- **{}** ({}): {}\n",
            repo.full_name, repo.integration_role, repo.why_it_fits
        ));
    }
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::schema::validate_repo_analysis;

    fn entry(repo_id: &str, final_score: f64, collab: f64, topics: &[&str]) -> PoolEntry {
        let output = validate_repo_analysis(&json!({
            "repo": {"full_name": repo_id},
            "scores": {
                "interestingness": final_score,
                "novelty": final_score,
                "collaboration_potential": collab
            },
            "reasons": {"interestingness": [], "novelty": [], "collaboration_potential": []},
            "signals": {"problem_summary": format!("tooling around {repo_id}")},
            "keywords": {"primary": [repo_id], "secondary": [], "search_queries": []}
        }))
        .unwrap();
        let signature = FunctionSignature::from_output(&output);
        PoolEntry {
            repo_id: repo_id.to_string(),
            stars: 100,
            language: Some("Rust".to_string()),
            license: None,
            topics: topics.iter().map(|t| t.to_string()).collect(),
            final_score,
            collaboration_potential: collab,
            output,
            signature,
        }
    }

    #[test]
    fn candidate_groups_are_deterministic() {
        let pool = vec![
            entry("c/c", 0.8, 0.8, &["db"]),
            entry("a/a", 0.9, 0.9, &["db"]),
            entry("b/b", 0.7, 0.7, &["cli"]),
        ];
        let first = candidate_groups(&pool, 0.6, 0.65, 200, false);
        let second = candidate_groups(&pool, 0.6, 0.65, 200, false);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        // Repo ids inside each group are sorted.
        for group in &first {
            let mut sorted = group.repo_ids.clone();
            sorted.sort();
            assert_eq!(sorted, group.repo_ids);
        }
    }

    #[test]
    fn candidate_groups_respect_max_combos_strictly() {
        let pool: Vec<PoolEntry> = (0..10)
            .map(|i| entry(&format!("owner/repo{i:02}"), 0.9, 0.9, &["db"]))
            .collect();
        let groups = candidate_groups(&pool, 0.6, 0.65, 7, false);
        assert_eq!(groups.len(), 7);
    }

    #[test]
    fn candidate_groups_drop_unqualified_entries() {
        let pool = vec![
            entry("a/a", 0.9, 0.9, &["db"]),
            entry("b/b", 0.5, 0.9, &["db"]),
            entry("c/c", 0.9, 0.5, &["db"]),
        ];
        let groups = candidate_groups(&pool, 0.6, 0.65, 200, false);
        assert!(groups.is_empty());
    }

    #[test]
    fn triples_average_internal_pair_scores() {
        let pool = vec![
            entry("a/a", 0.9, 0.9, &["db"]),
            entry("b/b", 0.9, 0.9, &["db"]),
            entry("c/c", 0.9, 0.9, &["db"]),
        ];
        let groups = candidate_groups(&pool, 0.6, 0.65, 200, true);
        let triple = groups.iter().find(|g| g.repo_ids.len() == 3).unwrap();
        // All three pairs score identically, so the average equals any pair.
        let pair = groups.iter().find(|g| g.repo_ids.len() == 2).unwrap();
        assert_eq!(triple.overlap_score, pair.overlap_score);
    }

    #[test]
    fn ordering_is_overlap_desc_then_ids_asc() {
        let pool = vec![
            entry("a/a", 0.9, 0.9, &["db"]),
            entry("b/b", 0.9, 0.9, &["db"]),
            entry("c/c", 0.9, 0.9, &["web"]),
        ];
        let groups = candidate_groups(&pool, 0.6, 0.65, 200, false);
        // a+b share a topic, so they outrank the cross-topic pairs; those
        // two tie and fall back to the joined id string.
        assert_eq!(groups[0].repo_ids, vec!["a/a", "b/b"]);
        assert_eq!(groups[1].repo_ids, vec!["a/a", "c/c"]);
        assert_eq!(groups[2].repo_ids, vec!["b/b", "c/c"]);
    }
}
