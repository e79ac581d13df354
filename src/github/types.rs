//! Wire types for the GitHub REST API.

use serde::{Deserialize, Serialize};

use crate::store::runs::RateLimitSnapshot;

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRepositoriesResponse {
    #[serde(default)]
    pub total_count: i64,
    #[serde(default)]
    pub incomplete_results: bool,
    #[serde(default)]
    pub items: Vec<SearchRepo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRepo {
    pub full_name: String,
    #[serde(default)]
    pub stargazers_count: i64,
    #[serde(default)]
    pub forks_count: i64,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub license: Option<LicenseInfo>,
    #[serde(default)]
    pub pushed_at: Option<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub fork: bool,
}

impl SearchRepo {
    pub fn license_id(&self) -> Option<String> {
        self.license.as_ref().and_then(|l| l.spdx_id.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LicenseInfo {
    #[serde(default)]
    pub spdx_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitResponse {
    pub resources: RateLimitResources,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitResources {
    pub core: RateLimitResource,
    pub search: RateLimitResource,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RateLimitResource {
    pub limit: i64,
    pub remaining: i64,
    pub reset: i64,
}

impl RateLimitResponse {
    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            search_limit: self.resources.search.limit,
            search_remaining: self.resources.search.remaining,
            search_reset: self.resources.search.reset,
            core_limit: self.resources.core.limit,
            core_remaining: self.resources.core.remaining,
            core_reset: self.resources.core.reset,
        }
    }
}
