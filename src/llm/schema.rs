//! Validation of LLM output against named schemas.
//!
//! Each schema is a self-contained validated value produced here and
//! consumed by exactly one caller. Validation failures feed the LLM client's
//! retry loop; the error strings name the offending field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const REPO_ANALYSIS_SCHEMA_ID: &str = "RepoAnalysisOutput";
pub const BRIEF_SCHEMA_ID: &str = "BriefOutput";

const MAX_REASONS: usize = 8;
const MAX_PRIMARY: usize = 12;
const MAX_SECONDARY: usize = 24;
const MAX_SEARCH_QUERIES: usize = 10;

// =============================================================================
// RepoAnalysisOutput
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoAnalysisOutput {
    pub repo: RepoIdent,
    pub scores: AnalysisScores,
    pub reasons: AnalysisReasons,
    #[serde(default)]
    pub signals: AnalysisSignals,
    #[serde(default)]
    pub keywords: AnalysisKeywords,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoIdent {
    pub full_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AnalysisScores {
    pub interestingness: f64,
    pub novelty: f64,
    pub collaboration_potential: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisReasons {
    #[serde(default)]
    pub interestingness: Vec<String>,
    #[serde(default)]
    pub novelty: Vec<String>,
    #[serde(default)]
    pub collaboration_potential: Vec<String>,
}

/// `risk_flags` keeps the absent-versus-empty distinction: `None` means the
/// model did not report the field, `Some(vec![])` means it reported an empty
/// list. Scoring treats only the latter as "no risks found".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisSignals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub who_is_it_for: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_surface: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_flags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisKeywords {
    #[serde(default)]
    pub primary: Vec<String>,
    #[serde(default)]
    pub secondary: Vec<String>,
    #[serde(default)]
    pub search_queries: Vec<String>,
}

pub fn validate_repo_analysis(value: &Value) -> Result<RepoAnalysisOutput, String> {
    let output: RepoAnalysisOutput =
        serde_json::from_value(value.clone()).map_err(|e| format!("shape mismatch: {e}"))?;

    if output.repo.full_name.trim().is_empty() {
        return Err("repo.full_name must be non-empty".to_string());
    }
    check_score("scores.interestingness", output.scores.interestingness)?;
    check_score("scores.novelty", output.scores.novelty)?;
    check_score(
        "scores.collaboration_potential",
        output.scores.collaboration_potential,
    )?;
    check_len("reasons.interestingness", output.reasons.interestingness.len(), MAX_REASONS)?;
    check_len("reasons.novelty", output.reasons.novelty.len(), MAX_REASONS)?;
    check_len(
        "reasons.collaboration_potential",
        output.reasons.collaboration_potential.len(),
        MAX_REASONS,
    )?;
    check_len("keywords.primary", output.keywords.primary.len(), MAX_PRIMARY)?;
    check_len("keywords.secondary", output.keywords.secondary.len(), MAX_SECONDARY)?;
    check_len(
        "keywords.search_queries",
        output.keywords.search_queries.len(),
        MAX_SEARCH_QUERIES,
    )?;

    Ok(output)
}

fn check_score(name: &str, score: f64) -> Result<(), String> {
    if !(0.0..=1.0).contains(&score) || !score.is_finite() {
        return Err(format!("{name} must be in [0, 1], got {score}"));
    }
    Ok(())
}

fn check_len(name: &str, len: usize, max: usize) -> Result<(), String> {
    if len > max {
        return Err(format!("{name} has {len} items, max {max}"));
    }
    Ok(())
}

// =============================================================================
// BriefOutput
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BriefOutput {
    pub title: String,
    pub concept: String,
    pub repos: Vec<BriefRepoEntry>,
    pub outreach_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BriefRepoEntry {
    pub full_name: String,
    pub why_it_fits: String,
    pub integration_role: String,
}

pub fn validate_brief(value: &Value) -> Result<BriefOutput, String> {
    let output: BriefOutput =
        serde_json::from_value(value.clone()).map_err(|e| format!("shape mismatch: {e}"))?;

    check_chars("title", &output.title, 100)?;
    check_chars("concept", &output.concept, 600)?;
    check_chars("outreach_message", &output.outreach_message, 1_000)?;
    if !(2..=4).contains(&output.repos.len()) {
        return Err(format!("repos must have 2-4 entries, got {}", output.repos.len()));
    }
    for entry in &output.repos {
        if entry.full_name.trim().is_empty() {
            return Err("repos[].full_name must be non-empty".to_string());
        }
        check_chars("repos[].why_it_fits", &entry.why_it_fits, 300)?;
        check_chars("repos[].integration_role", &entry.integration_role, 100)?;
    }

    Ok(output)
}

fn check_chars(name: &str, text: &str, max: usize) -> Result<(), String> {
    if text.trim().is_empty() {
        return Err(format!("{name} must be non-empty"));
    }
    let len = text.chars().count();
    if len > max {
        return Err(format!("{name} is {len} chars, max {max}"));
    }
    Ok(())
}
