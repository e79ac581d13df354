//! GitHub search-query qualifier grammar.
//!
//! Qualifier order is stable so recorded query strings are reproducible:
//! stars, pushed, archived, fork, language, in:readme.

use chrono::{Duration, NaiveDate};

#[derive(Debug, Clone)]
pub struct QualifierParams {
    pub days: i64,
    pub stars: i64,
    pub max_stars: Option<i64>,
    pub language: Option<String>,
    pub include_forks: bool,
    pub include_archived: bool,
    pub in_readme: bool,
}

impl Default for QualifierParams {
    fn default() -> Self {
        Self {
            days: 180,
            stars: 50,
            max_stars: None,
            language: None,
            include_forks: false,
            include_archived: false,
            in_readme: false,
        }
    }
}

/// `{user_query} stars:... pushed:>=YYYY-MM-DD archived:... [fork:false]
/// [language:L] [in:readme]`
pub fn build_search_query(user_query: &str, params: &QualifierParams, today: NaiveDate) -> String {
    let mut parts: Vec<String> = vec![user_query.trim().to_string()];

    match params.max_stars {
        Some(max) => parts.push(format!("stars:{}..{}", params.stars, max)),
        None => parts.push(format!("stars:>={}", params.stars)),
    }

    let cutoff = today - Duration::days(params.days);
    parts.push(format!("pushed:>={}", cutoff.format("%Y-%m-%d")));

    parts.push(format!("archived:{}", params.include_archived));

    if !params.include_forks {
        parts.push("fork:false".to_string());
    }
    if let Some(language) = &params.language {
        parts.push(format!("language:{language}"));
    }
    if params.in_readme {
        parts.push("in:readme".to_string());
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 2).unwrap()
    }

    #[test]
    fn default_params_produce_stable_qualifier_order() {
        let query = build_search_query("vector database", &QualifierParams::default(), today());
        assert_eq!(
            query,
            "vector database stars:>=50 pushed:>=2026-02-03 archived:false fork:false"
        );
    }

    #[test]
    fn max_stars_switches_to_range_form() {
        let params = QualifierParams {
            stars: 15,
            max_stars: Some(400),
            ..Default::default()
        };
        let query = build_search_query("parser", &params, today());
        assert!(query.contains("stars:15..400"));
        assert!(!query.contains("stars:>="));
    }

    #[test]
    fn optional_qualifiers_appear_when_set() {
        let params = QualifierParams {
            language: Some("Rust".to_string()),
            include_forks: true,
            in_readme: true,
            ..Default::default()
        };
        let query = build_search_query("cli", &params, today());
        assert!(query.contains("language:Rust"));
        assert!(query.ends_with("in:readme"));
        assert!(!query.contains("fork:false"));
    }

    #[test]
    fn date_is_today_minus_days() {
        let params = QualifierParams {
            days: 2,
            ..Default::default()
        };
        let query = build_search_query("q", &params, today());
        assert!(query.contains("pushed:>=2026-07-31"));
    }
}
