//! Candidate overlap scoring and the functional-overlap competitor filter.
//!
//! Everything here is a pure function over token sets, so grouping decisions
//! are reproducible from stored analysis output alone.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;

use crate::llm::schema::RepoAnalysisOutput;

use super::scoring::round6;

/// Tokens that exempt a high-overlap pair from competitor rejection: the
/// pair plausibly exists to interoperate, not to compete.
pub const INTEROP_TRIGGERS: &[&str] = &[
    "migration",
    "migrate",
    "interop",
    "compat",
    "compatibility",
    "adapter",
    "bridge",
    "benchmark",
    "benchmarks",
    "spec",
    "standard",
    "standards",
    "translator",
    "import",
    "export",
    "convert",
    "conversion",
];

static STOPWORDS: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    [
        "the", "and", "for", "with", "that", "this", "from", "into", "are", "was", "were", "can",
        "has", "have", "had", "its", "you", "your", "our", "their", "any", "all", "not", "but",
        "over", "under", "via", "per", "when", "where", "what", "which", "who", "how", "will",
        "more", "most", "some", "such", "than", "then", "them", "they", "also", "each", "other",
        "been", "being", "does", "don", "out", "use", "uses", "using", "used",
    ]
    .into_iter()
    .collect()
});

/// Lowercase, split on non-alphanumeric runs, drop stopwords and tokens
/// shorter than three characters.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3 && !STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

/// Jaccard similarity; two empty sets have zero overlap.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

// =============================================================================
// Function signature
// =============================================================================

/// Token-set fingerprint of one analyzed repo.
#[derive(Debug, Clone)]
pub struct FunctionSignature {
    /// Tokens of `signals.problem_summary`.
    pub problem: BTreeSet<String>,
    /// Lowercased `signals.integration_surface` items.
    pub surface: BTreeSet<String>,
    /// Lowercased `keywords.primary` items.
    pub primary: BTreeSet<String>,
    /// Lowercased `keywords.secondary` items.
    pub secondary: BTreeSet<String>,
    /// Tokens of every `keywords.search_queries` entry.
    pub query_tokens: BTreeSet<String>,
    /// Flattened token view of keywords and surfaces, for trigger checks.
    trigger_scan: BTreeSet<String>,
}

impl FunctionSignature {
    pub fn from_output(output: &RepoAnalysisOutput) -> Self {
        let problem = output
            .signals
            .problem_summary
            .as_deref()
            .map(tokenize)
            .unwrap_or_default();
        let surface: BTreeSet<String> = output
            .signals
            .integration_surface
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        let primary: BTreeSet<String> = lower_set(&output.keywords.primary);
        let secondary: BTreeSet<String> = lower_set(&output.keywords.secondary);
        let query_tokens: BTreeSet<String> = output
            .keywords
            .search_queries
            .iter()
            .flat_map(|q| tokenize(q))
            .collect();

        let mut trigger_scan: BTreeSet<String> = BTreeSet::new();
        for set in [&surface, &primary, &secondary, &query_tokens] {
            for item in set.iter() {
                trigger_scan.insert(item.clone());
                for token in item.split(|c: char| !c.is_alphanumeric()) {
                    if token.len() >= 3 {
                        trigger_scan.insert(token.to_string());
                    }
                }
            }
        }

        Self {
            problem,
            surface,
            primary,
            secondary,
            query_tokens,
            trigger_scan,
        }
    }

    /// Does any keyword or surface carry an interop trigger token?
    pub fn has_interop_trigger(&self) -> bool {
        INTEROP_TRIGGERS
            .iter()
            .any(|t| self.trigger_scan.contains(*t))
    }

    /// "api" or "sdk" appears among the surface tokens.
    pub fn has_api_or_sdk_surface(&self) -> bool {
        self.surface.iter().any(|item| {
            item.split(|c: char| !c.is_alphanumeric())
                .any(|t| t == "api" || t == "sdk")
        })
    }
}

fn lower_set(items: &[String]) -> BTreeSet<String> {
    items
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

// =============================================================================
// Candidate overlap score
// =============================================================================

/// Affinity score for a candidate pair, in [0, 1]:
/// topic Jaccard ×0.4, language match 0.2, surface Jaccard ×0.2, and a 0.2
/// complement bonus when exactly one side exposes an api/sdk surface.
pub fn candidate_overlap_score(
    topics_a: &BTreeSet<String>,
    topics_b: &BTreeSet<String>,
    language_a: Option<&str>,
    language_b: Option<&str>,
    sig_a: &FunctionSignature,
    sig_b: &FunctionSignature,
) -> f64 {
    let topic_overlap = jaccard(topics_a, topics_b) * 0.4;
    let language_match = match (language_a, language_b) {
        (Some(a), Some(b)) if a.eq_ignore_ascii_case(b) => 0.2,
        _ => 0.0,
    };
    let surface_overlap = jaccard(&sig_a.surface, &sig_b.surface) * 0.2;
    let complement_bonus = if sig_a.has_api_or_sdk_surface() != sig_b.has_api_or_sdk_surface() {
        0.2
    } else {
        0.0
    };
    round6(topic_overlap + language_match + surface_overlap + complement_bonus)
}

// =============================================================================
// Competitor filter
// =============================================================================

pub const INTEROP_EXCEPTION_REASON: &str = "interop_exception";

#[derive(Debug, Clone)]
pub struct PairFilterOutcome {
    pub functional_overlap: f64,
    pub rejected: bool,
    pub exception_triggered: bool,
    pub exception_reason: Option<&'static str>,
    pub penalty_applied: f64,
}

/// Decide whether two repos are functional competitors.
///
/// `functional_overlap = 0.45·sim(problem) + 0.35·sim(surface) +
/// 0.20·sim(primary)`, rounded to 10^-6. Below `threshold` the pair passes
/// with no penalty; at or above it, an interop trigger on either side
/// converts rejection into a penalized allowance.
pub fn filter_pair(
    a: &FunctionSignature,
    b: &FunctionSignature,
    threshold: f64,
    exception_penalty: f64,
) -> PairFilterOutcome {
    let functional_overlap = round6(
        0.45 * jaccard(&a.problem, &b.problem)
            + 0.35 * jaccard(&a.surface, &b.surface)
            + 0.20 * jaccard(&a.primary, &b.primary),
    );

    if functional_overlap < threshold {
        return PairFilterOutcome {
            functional_overlap,
            rejected: false,
            exception_triggered: false,
            exception_reason: None,
            penalty_applied: 0.0,
        };
    }

    if a.has_interop_trigger() || b.has_interop_trigger() {
        return PairFilterOutcome {
            functional_overlap,
            rejected: false,
            exception_triggered: true,
            exception_reason: Some(INTEROP_EXCEPTION_REASON),
            penalty_applied: exception_penalty,
        };
    }

    PairFilterOutcome {
        functional_overlap,
        rejected: true,
        exception_triggered: false,
        exception_reason: None,
        penalty_applied: 0.0,
    }
}
