//! Deterministic scoring policy and read-only replay.
//!
//! The policy is a versioned JSON file of weights, bonuses and thresholds.
//! `final_score` is a pure function of the stored LLM scores and signals
//! under a policy, so any run can be recomputed offline.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::llm::schema::{AnalysisScores, AnalysisSignals};
use crate::store::{Store, StoreError};

const BUILTIN_POLICY: &str = include_str!("../../policies/default.json");

static API_OR_SDK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bapi\b|\bsdk\b").expect("valid api/sdk pattern"));

/// Round to 10^-6, the precision every persisted score uses.
pub fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

#[derive(Debug, thiserror::Error)]
pub enum ScoringError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("policy parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringPolicy {
    pub version: String,
    pub weights: Weights,
    pub signals_bonus: SignalsBonus,
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Weights {
    pub w1_interestingness: f64,
    pub w2_novelty: f64,
    pub w3_collaboration_potential: f64,
    pub w4_signals_bonus: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SignalsBonus {
    pub has_integration_surface: f64,
    pub has_api_or_sdk: f64,
    pub no_risk_flags: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thresholds {
    pub min_repo_score_for_brief: f64,
    pub min_collaboration_potential_for_brief: f64,
    pub min_brief_score: f64,
}

impl ScoringPolicy {
    pub fn builtin() -> Self {
        serde_json::from_str(BUILTIN_POLICY).expect("builtin policy is well-formed")
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ScoringError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Signals bonus. `no_risk_flags` fires only when `risk_flags` was
    /// explicitly present and empty; an absent field earns nothing. The
    /// distinction is load-bearing for scoring stability.
    pub fn signals_bonus_for(&self, signals: &AnalysisSignals) -> f64 {
        let mut bonus = 0.0;
        let surface = signals.integration_surface.as_deref().unwrap_or(&[]);
        if !surface.is_empty() {
            bonus += self.signals_bonus.has_integration_surface;
            if surface.iter().any(|s| API_OR_SDK.is_match(s)) {
                bonus += self.signals_bonus.has_api_or_sdk;
            }
        }
        if matches!(&signals.risk_flags, Some(flags) if flags.is_empty()) {
            bonus += self.signals_bonus.no_risk_flags;
        }
        bonus
    }

    /// `w1·i + w2·n + w3·c + w4·bonus`, rounded to 10^-6.
    pub fn final_score(&self, scores: &AnalysisScores, signals: &AnalysisSignals) -> f64 {
        let bonus = self.signals_bonus_for(signals);
        round6(
            self.weights.w1_interestingness * scores.interestingness
                + self.weights.w2_novelty * scores.novelty
                + self.weights.w3_collaboration_potential * scores.collaboration_potential
                + self.weights.w4_signals_bonus * bonus,
        )
    }
}

// =============================================================================
// Replay
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ReplayDiff {
    pub repo_id: String,
    pub stored: f64,
    pub recomputed: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayResult {
    pub run_id: String,
    pub policy_version: String,
    pub replayed: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub diffs: Vec<ReplayDiff>,
}

/// Recompute every stored analysis score under `policy`. Strictly read-only:
/// no store mutation, no network.
pub fn replay_run(
    store: &Store,
    run_id: &str,
    policy: &ScoringPolicy,
) -> Result<ReplayResult, ScoringError> {
    let analyses = store.analyses_for_run(run_id)?;

    let mut diffs = Vec::new();
    for analysis in &analyses {
        let scores: AnalysisScores = serde_json::from_value(analysis.llm_scores_json.clone())?;
        let signals: AnalysisSignals = analysis
            .output_json
            .get("signals")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        let recomputed = policy.final_score(&scores, &signals);
        if recomputed != analysis.final_score {
            diffs.push(ReplayDiff {
                repo_id: analysis.repo_id.clone(),
                stored: analysis.final_score,
                recomputed,
            });
        }
    }

    Ok(ReplayResult {
        run_id: run_id.to_string(),
        policy_version: policy.version.clone(),
        replayed: analyses.len(),
        changed: diffs.len(),
        unchanged: analyses.len() - diffs.len(),
        diffs,
    })
}
