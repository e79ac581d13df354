//! Two-pass discovery pipeline: search, hydrate, analyze, aggregate, expand.
//!
//! Pass 1 turns a user query into analyzed repositories. The keyword
//! aggregation folds the best analyses into run-level search terms, and pass
//! 2 re-searches with those terms under hard caps. Every phase is a named
//! step with its own terminal status and audit trail.

pub mod query;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::briefs::scoring::{round6, ScoringError, ScoringPolicy};
use crate::github::{GithubClient, GithubError};
use crate::llm::prompts::{PromptError, PromptRegistry, DEFAULT_VERSION, REPO_ANALYSIS_ID};
use crate::llm::schema::{validate_repo_analysis, RepoAnalysisOutput};
use crate::llm::{LlmClient, LlmError, LlmRequest, Message};
use crate::orchestrator::{AuditLevel, RunOrchestrator, StepName};
use crate::store::analysis::{keyword_id, KeywordKind, KeywordRecord, NewAnalysis};
use crate::store::now_epoch_ms;
use crate::store::repos::{ReadmeRecord, RepoRecord};
use crate::store::runs::StepStatus;
use crate::store::{Store, StoreError};

use query::{build_search_query, QualifierParams};

/// Default README excerpt bound handed to the analysis prompt.
pub const DEFAULT_README_EXCERPT_CHARS: usize = 8_000;
/// Top-K analyses feeding keyword aggregation.
pub const DEFAULT_AGGREGATE_TOP_K: usize = 20;
/// Hard pass-2 caps.
pub const DEFAULT_MAX_NEW_REPOS: usize = 200;
pub const DEFAULT_MAX_LLM_ANALYSES: usize = 200;

const SEARCH_PAGE_SIZE: u32 = 100;
const PASS2_PAGE_SIZE: u32 = 50;

/// Per-repo keyword weights by kind; aggregation multiplies these by the
/// owning repo's final score.
fn kind_weight(kind: KeywordKind) -> f64 {
    match kind {
        KeywordKind::Primary => 1.0,
        KeywordKind::Secondary => 0.5,
        KeywordKind::SearchQuery => 1.0,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("github error: {0}")]
    Github(#[from] GithubError),
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),
    #[error("prompt error: {0}")]
    Prompt(#[from] PromptError),
    #[error("scoring error: {0}")]
    Scoring(#[from] ScoringError),
}

// =============================================================================
// Parameters
// =============================================================================

#[derive(Debug, Clone)]
pub struct ScoutParams {
    pub query: String,
    pub days: i64,
    pub stars: i64,
    pub max_stars: Option<i64>,
    pub top_n: usize,
    pub language: Option<String>,
    pub include_forks: bool,
    pub model: String,
    pub readme_excerpt_chars: usize,
}

impl ScoutParams {
    pub fn new(query: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            days: 180,
            stars: 50,
            max_stars: None,
            top_n: 100,
            language: None,
            include_forks: false,
            model: model.into(),
            readme_excerpt_chars: DEFAULT_README_EXCERPT_CHARS,
        }
    }

    pub fn qualifiers(&self) -> QualifierParams {
        QualifierParams {
            days: self.days,
            stars: self.stars,
            max_stars: self.max_stars,
            language: self.language.clone(),
            include_forks: self.include_forks,
            include_archived: false,
            in_readme: false,
        }
    }

    pub fn as_json(&self) -> Value {
        json!({
            "query": self.query,
            "days": self.days,
            "stars": self.stars,
            "max_stars": self.max_stars,
            "top_n": self.top_n,
            "language": self.language,
            "include_forks": self.include_forks,
            "model": self.model,
            "readme_excerpt_chars": self.readme_excerpt_chars,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExpandParams {
    pub pass2_stars: i64,
    pub pass2_max_stars: Option<i64>,
    pub max_queries: usize,
    pub max_new_repos_total: usize,
    pub max_llm_analyses_total: usize,
    pub model: String,
    pub readme_excerpt_chars: usize,
    pub aggregate_top_k: usize,
}

impl ExpandParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            pass2_stars: 15,
            pass2_max_stars: None,
            max_queries: 10,
            max_new_repos_total: DEFAULT_MAX_NEW_REPOS,
            max_llm_analyses_total: DEFAULT_MAX_LLM_ANALYSES,
            model: model.into(),
            readme_excerpt_chars: DEFAULT_README_EXCERPT_CHARS,
            aggregate_top_k: DEFAULT_AGGREGATE_TOP_K,
        }
    }
}

// =============================================================================
// Summaries
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Pass1Summary {
    pub run_id: String,
    pub query: String,
    pub repos_discovered: usize,
    pub readmes_fetched: usize,
    pub readmes_missing: usize,
    pub analyzed: usize,
    pub analysis_failed: usize,
    pub failed_steps: Vec<String>,
}

impl Pass1Summary {
    pub fn ok(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Pass2Summary {
    pub run_id: String,
    pub queries_issued: usize,
    pub new_repos: usize,
    pub analyzed: usize,
    pub analysis_failed: usize,
    pub capped: bool,
    pub cap_reason: Option<String>,
    pub failed_steps: Vec<String>,
}

impl Pass2Summary {
    pub fn ok(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

/// One run-aggregate keyword, already sorted into final order.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateKeyword {
    pub keyword: String,
    pub kind: KeywordKind,
    pub weight: f64,
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct DiscoveryPipeline<'a> {
    pub store: &'a Store,
    pub github: &'a GithubClient,
    pub llm: &'a LlmClient,
    pub prompts: &'a PromptRegistry,
    pub policy: &'a ScoringPolicy,
    pub orchestrator: &'a RunOrchestrator,
}

impl<'a> DiscoveryPipeline<'a> {
    /// Pass 1: snapshot, search, hydrate, analyze.
    pub async fn run_pass1(&self, params: &ScoutParams) -> Result<Pass1Summary, PipelineError> {
        let run_id = self.orchestrator.run_id().to_string();
        let mut failed_steps = Vec::new();

        self.snapshot_rate_limit().await?;

        let (search_query, discovered) = self.search_pass1(params).await?;
        let hydrated = self.hydrate_metadata(&discovered)?;
        let (readmes_fetched, readmes_missing) = self.hydrate_readmes(&hydrated).await?;

        let eligible = self.eligible_for_analysis(&hydrated)?;
        let (analyzed, analysis_failed) = self
            .analyze_repos(&eligible, &params.model, params.readme_excerpt_chars, None)
            .await?;
        if analyzed == 0 && analysis_failed > 0 {
            failed_steps.push(StepName::LlmRepoAnalysis.as_str().to_string());
        }

        Ok(Pass1Summary {
            run_id,
            query: search_query,
            repos_discovered: discovered.len(),
            readmes_fetched,
            readmes_missing,
            analyzed,
            analysis_failed,
            failed_steps,
        })
    }

    /// Pass 2: aggregate keywords, generate queries, expand under caps.
    pub async fn run_pass2(&self, params: &ExpandParams) -> Result<Pass2Summary, PipelineError> {
        let run_id = self.orchestrator.run_id().to_string();
        let mut failed_steps = Vec::new();

        let aggregates = self.aggregate_keywords(params.aggregate_top_k)?;
        let queries = pass2_queries(&aggregates, params.max_queries);

        // Original pass-1 exclusions travel with the run.
        let run = self.store.get_run(&run_id)?;
        let args = &run.args_json;
        let qualifiers = QualifierParams {
            days: args.get("days").and_then(Value::as_i64).unwrap_or(180),
            stars: params.pass2_stars,
            max_stars: params.pass2_max_stars,
            language: args
                .get("language")
                .and_then(Value::as_str)
                .map(str::to_string),
            include_forks: args
                .get("include_forks")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            include_archived: false,
            in_readme: false,
        };

        let expansion = self
            .search_pass2(&queries, &qualifiers, params.max_new_repos_total)
            .await?;

        self.hydrate_readmes(&expansion.to_analyze).await?;

        let mut eligible = self.eligible_for_analysis(&expansion.to_analyze)?;
        let mut capped = expansion.capped;
        let mut cap_reason = expansion.cap_reason.clone();
        let mut analysis_cap: Option<&str> = None;
        if eligible.len() > params.max_llm_analyses_total {
            eligible.truncate(params.max_llm_analyses_total);
            capped = true;
            analysis_cap = Some("max_llm_analyses_total");
            cap_reason.get_or_insert_with(|| "max_llm_analyses_total".to_string());
            self.orchestrator.log_audit(
                AuditLevel::Warn,
                StepName::LlmRepoAnalysis.as_str(),
                "pass2.analyses.capped",
                "pass 2 analysis cap reached",
                json!({ "cap": params.max_llm_analyses_total }),
            )?;
        }

        let (analyzed, analysis_failed) = self
            .analyze_repos(
                &eligible,
                &params.model,
                params.readme_excerpt_chars,
                analysis_cap,
            )
            .await?;
        if analyzed == 0 && analysis_failed > 0 {
            failed_steps.push(StepName::LlmRepoAnalysis.as_str().to_string());
        }

        Ok(Pass2Summary {
            run_id,
            queries_issued: queries.len(),
            new_repos: expansion.new_repos,
            analyzed,
            analysis_failed,
            capped,
            cap_reason,
            failed_steps,
        })
    }

    // =========================================================================
    // Steps
    // =========================================================================

    async fn snapshot_rate_limit(&self) -> Result<(), PipelineError> {
        let step = self.orchestrator.start_step(StepName::GithubRateLimitSnapshot)?;
        match self.github.rate_limit().await {
            Ok(response) => {
                let snapshot = response.snapshot();
                self.store.insert_rate_limit_snapshot(
                    self.orchestrator.run_id(),
                    now_epoch_ms(),
                    &snapshot,
                )?;
                step.finish(
                    StepStatus::Success,
                    json!({
                        "search_remaining": snapshot.search_remaining,
                        "core_remaining": snapshot.core_remaining,
                    }),
                )?;
                Ok(())
            }
            Err(err) => {
                self.fail_step(step, StepName::GithubRateLimitSnapshot, &err)?;
                Err(err.into())
            }
        }
    }

    /// Search + record the query. Returns the query string and discovered
    /// repos in rank order.
    async fn search_pass1(
        &self,
        params: &ScoutParams,
    ) -> Result<(String, Vec<RepoRecord>), PipelineError> {
        let step = self.orchestrator.start_step(StepName::GithubSearchPass1)?;
        let search_query =
            build_search_query(&params.query, &params.qualifiers(), Utc::now().date_naive());

        let result = self
            .collect_search(&search_query, params.top_n, SEARCH_PAGE_SIZE, 1, &params.as_json())
            .await;

        match result {
            Ok((query_id, repos)) => {
                step.finish(
                    StepStatus::Success,
                    json!({ "query_id": query_id, "repos": repos.len() }),
                )?;
                Ok((search_query, repos))
            }
            Err(err) => {
                self.fail_step(step, StepName::GithubSearchPass1, &err)?;
                Err(err)
            }
        }
    }

    /// Page through one search, recording the query row and rank links.
    async fn collect_search(
        &self,
        search_query: &str,
        limit: usize,
        page_size: u32,
        pass: i64,
        params_json: &Value,
    ) -> Result<(i64, Vec<RepoRecord>), PipelineError> {
        let run_id = self.orchestrator.run_id();
        let query_id = self
            .store
            .insert_github_query(run_id, pass, search_query, params_json)?;

        let mut repos: Vec<RepoRecord> = Vec::new();
        let mut page = 1u32;
        loop {
            let remaining = limit.saturating_sub(repos.len());
            if remaining == 0 {
                break;
            }
            let per_page = page_size.min(remaining as u32).max(1);
            let response = self
                .github
                .search_repositories(search_query, page, per_page)
                .await?;

            let count = response.items.len();
            for item in response.items {
                let license = item.license_id();
                repos.push(RepoRecord {
                    full_name: item.full_name,
                    stars: item.stargazers_count,
                    forks: item.forks_count,
                    topics: item.topics,
                    language: item.language,
                    license,
                    pushed_at: item.pushed_at,
                    archived: item.archived,
                    fork: item.fork,
                    last_seen_run_id: run_id.to_string(),
                });
            }

            if response.incomplete_results || count < per_page as usize {
                break;
            }
            page += 1;
        }

        // Upserts and rank links land in the hydrate_repo_metadata step.
        Ok((query_id, repos))
    }

    /// Upsert discovered repos and link them to their query.
    fn hydrate_metadata(&self, discovered: &[RepoRecord]) -> Result<Vec<String>, PipelineError> {
        let step = self.orchestrator.start_step(StepName::HydrateRepoMetadata)?;
        let run_id = self.orchestrator.run_id();

        let result: Result<Vec<String>, StoreError> = (|| {
            let queries = self.store.queries_for_run(run_id)?;
            let query_id = queries
                .iter()
                .rev()
                .find(|q| q.pass == 1)
                .map(|q| q.id)
                .unwrap_or_default();
            let mut names = Vec::with_capacity(discovered.len());
            for (index, repo) in discovered.iter().enumerate() {
                self.store.upsert_repo(repo)?;
                self.store
                    .link_repo_query(query_id, &repo.full_name, index as i64 + 1, 1)?;
                names.push(repo.full_name.clone());
            }
            Ok(names)
        })();

        match result {
            Ok(names) => {
                step.finish(StepStatus::Success, json!({ "repos": names.len() }))?;
                Ok(names)
            }
            Err(err) => {
                let err = PipelineError::from(err);
                self.fail_step(step, StepName::HydrateRepoMetadata, &err)?;
                Err(err)
            }
        }
    }

    /// Fetch READMEs for repos that have none. 404 is recorded, not fatal;
    /// rate-limit exhaustion fails the step.
    async fn hydrate_readmes(&self, repos: &[String]) -> Result<(usize, usize), PipelineError> {
        let step = self.orchestrator.start_step(StepName::HydrateReadme)?;
        let mut fetched = 0usize;
        let mut missing = 0usize;
        let mut failed = 0usize;

        let mut ordered: Vec<&String> = repos.iter().collect();
        ordered.sort();
        ordered.dedup();

        for repo in ordered {
            if self.store.has_readme(repo)? {
                continue;
            }
            match self.github.fetch_readme(repo).await {
                Ok(Some(readme)) => {
                    let bytes = readme.text.into_bytes();
                    let digest = Sha256::digest(&bytes);
                    let sha256: String = digest.iter().map(|b| format!("{b:02x}")).collect();
                    self.store.upsert_readme(&ReadmeRecord {
                        repo_id: repo.clone(),
                        content: bytes,
                        content_sha256: sha256,
                        fetched_at: now_epoch_ms(),
                        etag: readme.etag,
                        source_url: readme.source_url,
                    })?;
                    self.orchestrator.log_audit(
                        AuditLevel::Info,
                        StepName::HydrateReadme.as_str(),
                        "repo.readme.fetched",
                        repo,
                        json!({ "repo": repo }),
                    )?;
                    fetched += 1;
                }
                Ok(None) => {
                    self.orchestrator.log_audit(
                        AuditLevel::Warn,
                        StepName::HydrateReadme.as_str(),
                        "repo.readme.missing",
                        repo,
                        json!({ "repo": repo }),
                    )?;
                    missing += 1;
                }
                Err(err @ GithubError::RateLimited { .. }) => {
                    let err = PipelineError::from(err);
                    self.fail_step(step, StepName::HydrateReadme, &err)?;
                    return Err(err);
                }
                Err(err) => {
                    self.orchestrator.log_audit(
                        AuditLevel::Error,
                        StepName::HydrateReadme.as_str(),
                        "repo.hydrate.failed",
                        repo,
                        json!({ "repo": repo, "error": err.to_string(), "code": err.code() }),
                    )?;
                    failed += 1;
                }
            }
        }

        step.finish(
            StepStatus::Success,
            json!({ "fetched": fetched, "missing": missing, "failed": failed }),
        )?;
        Ok((fetched, missing))
    }

    /// Repos with a README and no analysis for this run, sorted by name.
    fn eligible_for_analysis(&self, repos: &[String]) -> Result<Vec<String>, PipelineError> {
        let run_id = self.orchestrator.run_id();
        let mut ordered: Vec<String> = repos.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut eligible = Vec::new();
        for repo in ordered {
            if self.store.has_readme(&repo)? && !self.store.has_analysis(run_id, &repo)? {
                eligible.push(repo);
            }
        }
        Ok(eligible)
    }

    /// Run LLM analysis per repo. The step fails only when every unit fails.
    async fn analyze_repos(
        &self,
        repos: &[String],
        model: &str,
        excerpt_chars: usize,
        cap_reason: Option<&str>,
    ) -> Result<(usize, usize), PipelineError> {
        let step = self.orchestrator.start_step(StepName::LlmRepoAnalysis)?;
        let mut analyzed = 0usize;
        let mut failed = 0usize;

        for repo in repos {
            match self.analyze_one(repo, model, excerpt_chars).await {
                Ok(()) => analyzed += 1,
                Err(AnalysisFailure::Invalid(message)) => {
                    self.orchestrator.log_audit(
                        AuditLevel::Error,
                        StepName::LlmRepoAnalysis.as_str(),
                        "llm.output.invalid_json",
                        repo,
                        json!({ "repo": repo, "error": message }),
                    )?;
                    failed += 1;
                }
                Err(AnalysisFailure::Call(err)) => {
                    self.orchestrator.log_audit(
                        AuditLevel::Error,
                        StepName::LlmRepoAnalysis.as_str(),
                        "llm.call.failed",
                        repo,
                        json!({ "repo": repo, "error": err.to_string(), "code": err.code() }),
                    )?;
                    failed += 1;
                }
                Err(AnalysisFailure::Fatal(err)) => {
                    self.fail_step(step, StepName::LlmRepoAnalysis, &err)?;
                    return Err(err);
                }
            }
        }

        let status = if repos.is_empty() {
            StepStatus::Skipped
        } else if analyzed == 0 {
            StepStatus::Failed
        } else {
            StepStatus::Success
        };
        let mut stats = json!({ "analyzed": analyzed, "failed": failed });
        if let Some(reason) = cap_reason {
            stats["capped"] = json!(true);
            stats["reason"] = json!(reason);
        }
        step.finish(status, stats)?;
        Ok((analyzed, failed))
    }

    async fn analyze_one(
        &self,
        repo_id: &str,
        model: &str,
        excerpt_chars: usize,
    ) -> Result<(), AnalysisFailure> {
        let run_id = self.orchestrator.run_id();
        let repo = self
            .store
            .get_repo(repo_id)
            .map_err(|e| AnalysisFailure::Fatal(e.into()))?
            .ok_or_else(|| AnalysisFailure::Invalid(format!("repo {repo_id} not in store")))?;
        let readme = self
            .store
            .get_readme(repo_id)
            .map_err(|e| AnalysisFailure::Fatal(e.into()))?
            .ok_or_else(|| AnalysisFailure::Invalid(format!("repo {repo_id} has no readme")))?;

        let template = self
            .prompts
            .get(REPO_ANALYSIS_ID, DEFAULT_VERSION)
            .map_err(|e| AnalysisFailure::Fatal(e.into()))?;

        let readme_text = String::from_utf8_lossy(&readme.content);
        let excerpt: String = readme_text.chars().take(excerpt_chars).collect();
        let rendered = template.render(&[
            ("full_name", &repo.full_name),
            ("stars", &repo.stars.to_string()),
            ("language", repo.language.as_deref().unwrap_or("unknown")),
            ("topics", &repo.topics.join(", ")),
            ("license", repo.license.as_deref().unwrap_or("unknown")),
            ("readme_excerpt", &excerpt),
        ]);

        let request = LlmRequest::new(model, vec![Message::user(rendered)])
            .temperature(template.temperature)
            .max_tokens(template.max_tokens);

        let output: RepoAnalysisOutput = self
            .llm
            .chat_validated(&request, validate_repo_analysis)
            .await
            .map_err(|err| match err {
                LlmError::InvalidOutput { message } => AnalysisFailure::Invalid(message),
                other => AnalysisFailure::Call(other),
            })?;

        if output.repo.full_name != repo.full_name {
            return Err(AnalysisFailure::Invalid(format!(
                "model answered for {} instead of {}",
                output.repo.full_name, repo.full_name
            )));
        }

        let final_score = self.policy.final_score(&output.scores, &output.signals);

        let input_json = json!({
            "readme_sha256": readme.content_sha256,
            "excerpt_chars": excerpt.chars().count(),
        });
        let output_json =
            serde_json::to_value(&output).map_err(|e| AnalysisFailure::Invalid(e.to_string()))?;
        let scores_json = serde_json::to_value(output.scores)
            .map_err(|e| AnalysisFailure::Invalid(e.to_string()))?;
        let reasons_json = serde_json::to_value(&output.reasons)
            .map_err(|e| AnalysisFailure::Invalid(e.to_string()))?;

        self.store
            .insert_analysis(&NewAnalysis {
                run_id,
                repo_id: &repo.full_name,
                model,
                prompt_id: REPO_ANALYSIS_ID,
                prompt_version: DEFAULT_VERSION,
                input_json: &input_json,
                output_json: &output_json,
                llm_scores_json: &scores_json,
                final_score,
                reasons_json: &reasons_json,
                created_at: now_epoch_ms(),
            })
            .map_err(|e| AnalysisFailure::Fatal(e.into()))?;

        self.insert_repo_keywords(run_id, &repo.full_name, &output)
            .map_err(AnalysisFailure::Fatal)?;

        Ok(())
    }

    fn insert_repo_keywords(
        &self,
        run_id: &str,
        repo_id: &str,
        output: &RepoAnalysisOutput,
    ) -> Result<(), PipelineError> {
        let groups = [
            (KeywordKind::Primary, &output.keywords.primary),
            (KeywordKind::Secondary, &output.keywords.secondary),
            (KeywordKind::SearchQuery, &output.keywords.search_queries),
        ];
        for (kind, terms) in groups {
            for term in terms {
                let term = term.trim();
                if term.is_empty() {
                    continue;
                }
                self.store.upsert_keyword(&KeywordRecord {
                    id: keyword_id(run_id, Some(repo_id), term, kind),
                    run_id: run_id.to_string(),
                    repo_id: Some(repo_id.to_string()),
                    keyword: term.to_string(),
                    kind,
                    weight: kind_weight(kind),
                })?;
            }
        }
        Ok(())
    }

    /// Fold per-repo keywords of the top-K analyses into run aggregates.
    /// Deterministic: same inputs give identical tuples in identical order.
    pub fn aggregate_keywords(
        &self,
        top_k: usize,
    ) -> Result<Vec<AggregateKeyword>, PipelineError> {
        let step = self.orchestrator.start_step(StepName::KeywordAggregate)?;
        let run_id = self.orchestrator.run_id();

        let result: Result<Vec<AggregateKeyword>, PipelineError> = (|| {
            let top = self.store.top_analyses_for_run(run_id, top_k)?;
            let score_by_repo: HashMap<&str, f64> = top
                .iter()
                .map(|a| (a.repo_id.as_str(), a.final_score))
                .collect();

            let mut buckets: HashMap<(KeywordKind, String), f64> = HashMap::new();
            for record in self.store.repo_keywords_for_run(run_id)? {
                let Some(repo_id) = record.repo_id.as_deref() else {
                    continue;
                };
                let Some(final_score) = score_by_repo.get(repo_id) else {
                    continue;
                };
                let normalized = record.keyword.trim().to_lowercase();
                if normalized.is_empty() {
                    continue;
                }
                *buckets.entry((record.kind, normalized)).or_insert(0.0) +=
                    record.weight * final_score;
            }

            let mut aggregates: Vec<AggregateKeyword> = buckets
                .into_iter()
                .map(|((kind, keyword), weight)| AggregateKeyword {
                    keyword,
                    kind,
                    weight: round6(weight),
                })
                .collect();
            aggregates.sort_by(|a, b| {
                b.weight
                    .partial_cmp(&a.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.keyword.cmp(&b.keyword))
                    .then_with(|| a.kind.as_str().cmp(b.kind.as_str()))
            });

            for aggregate in &aggregates {
                self.store.upsert_keyword(&KeywordRecord {
                    id: keyword_id(run_id, None, &aggregate.keyword, aggregate.kind),
                    run_id: run_id.to_string(),
                    repo_id: None,
                    keyword: aggregate.keyword.clone(),
                    kind: aggregate.kind,
                    weight: aggregate.weight,
                })?;
            }
            Ok(aggregates)
        })();

        match result {
            Ok(aggregates) => {
                step.finish(StepStatus::Success, json!({ "keywords": aggregates.len() }))?;
                Ok(aggregates)
            }
            Err(err) => {
                self.fail_step(step, StepName::KeywordAggregate, &err)?;
                Err(err)
            }
        }
    }

    /// Execute the generated pass-2 queries under the new-repo cap.
    async fn search_pass2(
        &self,
        queries: &[String],
        qualifiers: &QualifierParams,
        max_new_repos: usize,
    ) -> Result<Pass2Expansion, PipelineError> {
        let step = self.orchestrator.start_step(StepName::GithubSearchPass2)?;
        let run_id = self.orchestrator.run_id();

        let mut expansion = Pass2Expansion::default();
        let today = Utc::now().date_naive();

        let result: Result<(), PipelineError> = async {
            'queries: for term in queries {
                let search_query = build_search_query(term, qualifiers, today);
                let query_id = self.store.insert_github_query(
                    run_id,
                    2,
                    &search_query,
                    &json!({ "term": term }),
                )?;
                expansion.queries_issued += 1;

                let response = self
                    .github
                    .search_repositories(&search_query, 1, PASS2_PAGE_SIZE)
                    .await?;

                for (index, item) in response.items.into_iter().enumerate() {
                    let rank = index as i64 + 1;
                    if self.store.has_analysis(run_id, &item.full_name)? {
                        // Known quantity for this run; record the sighting only.
                        self.store
                            .link_repo_query(query_id, &item.full_name, rank, 2)?;
                        continue;
                    }

                    let newly_discovered = self.store.get_repo(&item.full_name)?.is_none();
                    if newly_discovered && expansion.new_repos >= max_new_repos {
                        expansion.capped = true;
                        expansion.cap_reason = Some("max_new_repos_total".to_string());
                        self.orchestrator.log_audit(
                            AuditLevel::Warn,
                            StepName::GithubSearchPass2.as_str(),
                            "pass2.repos.capped",
                            "pass 2 new-repo cap reached",
                            json!({ "cap": max_new_repos }),
                        )?;
                        break 'queries;
                    }

                    self.store.upsert_repo(&RepoRecord {
                        full_name: item.full_name.clone(),
                        stars: item.stargazers_count,
                        forks: item.forks_count,
                        topics: item.topics.clone(),
                        language: item.language.clone(),
                        license: item.license_id(),
                        pushed_at: item.pushed_at.clone(),
                        archived: item.archived,
                        fork: item.fork,
                        last_seen_run_id: run_id.to_string(),
                    })?;
                    self.store
                        .link_repo_query(query_id, &item.full_name, rank, 2)?;
                    if newly_discovered {
                        expansion.new_repos += 1;
                    }
                    if !expansion.to_analyze.contains(&item.full_name) {
                        expansion.to_analyze.push(item.full_name);
                    }
                }
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                let mut stats = json!({
                    "queries": expansion.queries_issued,
                    "new_repos": expansion.new_repos,
                });
                if expansion.capped {
                    stats["capped"] = json!(true);
                    stats["reason"] = json!(expansion.cap_reason);
                }
                step.finish(StepStatus::Success, stats)?;
                Ok(expansion)
            }
            Err(err) => {
                self.fail_step(step, StepName::GithubSearchPass2, &err)?;
                Err(err)
            }
        }
    }

    fn fail_step(
        &self,
        step: crate::orchestrator::StepHandle,
        name: StepName,
        err: &dyn std::fmt::Display,
    ) -> Result<(), StoreError> {
        let message = err.to_string();
        step.finish(StepStatus::Failed, json!({ "error": message }))?;
        self.orchestrator.log_audit(
            AuditLevel::Error,
            name.as_str(),
            "step.error",
            &message,
            json!({}),
        )
    }
}

#[derive(Debug, Default)]
struct Pass2Expansion {
    queries_issued: usize,
    new_repos: usize,
    to_analyze: Vec<String>,
    capped: bool,
    cap_reason: Option<String>,
}

enum AnalysisFailure {
    /// Schema/content failure; counted per unit.
    Invalid(String),
    /// Call-level failure other than invalid output; counted per unit.
    Call(LlmError),
    /// Store or prompt-registry failure; fails the whole step.
    Fatal(PipelineError),
}

/// Pass-2 query generation: all `search_query` aggregates in order, then
/// `primary` terms not already present, up to `max_queries`. First
/// occurrence wins on duplicates.
pub fn pass2_queries(aggregates: &[AggregateKeyword], max_queries: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();

    for aggregate in aggregates {
        if aggregate.kind == KeywordKind::SearchQuery && !out.contains(&aggregate.keyword) {
            out.push(aggregate.keyword.clone());
        }
    }
    for aggregate in aggregates {
        if out.len() >= max_queries {
            break;
        }
        if aggregate.kind == KeywordKind::Primary && !out.contains(&aggregate.keyword) {
            out.push(aggregate.keyword.clone());
        }
    }
    out.truncate(max_queries);
    out
}
