//! Read-only GitHub API client.
//!
//! Three coupled behaviors: a persistent conditional-GET cache (ETag /
//! Last-Modified revalidation), local token-bucket rate limiting, and
//! upstream 429/403/5xx backoff. Clock, sleeper and throttle sink are
//! injected so every wait is observable in tests.

pub mod rate_limit;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use serde::Serialize;
use serde_json::Value;

use crate::store::http_cache::{cache_key, HttpCacheEntry};
use crate::store::{Store, StoreError};

use rate_limit::{Bucket, Clock, RateLimiter, SystemClock};
use types::{RateLimitResponse, SearchRepositoriesResponse};

/// GitHub JSON media type (default accept header).
pub const GITHUB_JSON: &str = "application/vnd.github+json";
/// Raw media type used for README content.
pub const GITHUB_RAW: &str = "application/vnd.github.raw";

const API_VERSION: &str = "2022-11-28";
const USER_AGENT_VALUE: &str = "collab-scout";
const MAX_RATE_LIMIT_RETRIES: u32 = 3;
const MAX_SERVER_RETRIES: u32 = 3;
const FALLBACK_BACKOFF_MS: u64 = 60_000;

// =============================================================================
// Injectable effects
// =============================================================================

/// Injectable sleep, so tests observe waits instead of serving them.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleReason {
    TokenBucketEmpty,
    RateLimit429,
    SecondaryRateLimit403,
}

impl ThrottleReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TokenBucketEmpty => "token_bucket_empty",
            Self::RateLimit429 => "rate_limit_429",
            Self::SecondaryRateLimit403 => "secondary_rate_limit_403",
        }
    }
}

/// Emitted once per throttle-and-wait, before the sleep.
#[derive(Debug, Clone, Serialize)]
pub struct ThrottleEvent {
    pub bucket: &'static str,
    pub wait_ms: u64,
    pub reason: ThrottleReason,
    pub reset_at: Option<i64>,
}

pub trait ThrottleSink: Send + Sync {
    fn on_throttle(&self, event: &ThrottleEvent);
}

#[derive(Debug, Default)]
pub struct NoopThrottleSink;

impl ThrottleSink for NoopThrottleSink {
    fn on_throttle(&self, _event: &ThrottleEvent) {}
}

/// Writes throttle events into the run's audit log. Best-effort: a failed
/// audit write must not break the request in flight.
pub struct AuditThrottleSink {
    store: Store,
    run_id: String,
}

impl AuditThrottleSink {
    pub fn new(store: Store, run_id: impl Into<String>) -> Self {
        Self {
            store,
            run_id: run_id.into(),
        }
    }
}

impl ThrottleSink for AuditThrottleSink {
    fn on_throttle(&self, event: &ThrottleEvent) {
        let data = serde_json::to_value(event).unwrap_or_else(|_| Value::Null);
        let now = crate::store::now_epoch_ms();
        if let Err(err) = self.store.insert_audit(
            &self.run_id,
            now,
            "warn",
            "github",
            "github.throttled",
            event.reason.as_str(),
            &data,
        ) {
            tracing::warn!(error = %err, "failed to record throttle event");
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GithubError {
    /// Upstream rate limiting survived every retry.
    #[error("github rate limit exhausted after {retries} retries ({bucket} bucket)")]
    RateLimited { bucket: &'static str, retries: u32 },

    /// Non-2xx response that is not retried.
    #[error("github http {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GithubError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Http { .. } => "upstream_http",
            Self::Transport(_) => "transport",
            Self::Decode(_) => "decode",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
        }
    }
}

// =============================================================================
// Request / response
// =============================================================================

/// One API request. Base URL and mandatory headers are injected once at
/// client construction.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub path: String,
    pub accept: String,
    pub bucket: Bucket,
    pub query: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            accept: GITHUB_JSON.to_string(),
            bucket: Bucket::Core,
            query: Vec::new(),
        }
    }

    pub fn accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = accept.into();
        self
    }

    pub fn bucket(mut self, bucket: Bucket) -> Self {
        self.bucket = bucket;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub from_cache: bool,
    pub etag: Option<String>,
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct ReadmeFetch {
    pub text: String,
    pub etag: Option<String>,
    pub source_url: String,
}

// =============================================================================
// Client
// =============================================================================

pub struct GithubClient {
    http: reqwest::Client,
    base_url: String,
    store: Store,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    throttle: Arc<dyn ThrottleSink>,
}

impl GithubClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<&str>,
        store: Store,
    ) -> Result<Self, GithubError> {
        Self::with_parts(
            base_url,
            token,
            store,
            Arc::new(SystemClock),
            Arc::new(TokioSleeper),
            Arc::new(NoopThrottleSink),
        )
    }

    pub fn with_parts(
        base_url: impl Into<String>,
        token: Option<&str>,
        store: Store,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        throttle: Arc<dyn ThrottleSink>,
    ) -> Result<Self, GithubError> {
        let mut headers = HeaderMap::new();
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(API_VERSION));
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(USER_AGENT_VALUE),
        );
        if let Some(token) = token {
            let auth = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| GithubError::Config("invalid GITHUB_TOKEN format".to_string()))?;
            headers.insert(AUTHORIZATION, auth);
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| GithubError::Config(format!("failed to create HTTP client: {e}")))?;

        let now = clock.now_ms();
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            store,
            limiter: RateLimiter::new(now),
            clock,
            sleeper,
            throttle,
        })
    }

    fn build_url(&self, req: &ApiRequest) -> Result<reqwest::Url, GithubError> {
        let mut url = reqwest::Url::parse(&format!("{}{}", self.base_url, req.path))
            .map_err(|e| GithubError::Config(format!("invalid url: {e}")))?;
        if !req.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &req.query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Block until a local token is available, emitting a throttle event
    /// before every wait.
    async fn acquire_token(&self, bucket: Bucket) {
        loop {
            let wait_ms = self.limiter.consume(bucket, self.clock.now_ms());
            if wait_ms == 0 {
                return;
            }
            self.throttle.on_throttle(&ThrottleEvent {
                bucket: bucket.as_str(),
                wait_ms,
                reason: ThrottleReason::TokenBucketEmpty,
                reset_at: None,
            });
            self.sleeper.sleep(Duration::from_millis(wait_ms)).await;
        }
    }

    /// Wait for an upstream 429/403: `Retry-After` seconds, else the
    /// `X-RateLimit-Reset` epoch with a one-second buffer, else sixty seconds.
    fn upstream_wait(&self, headers: &HeaderMap) -> (u64, Option<i64>) {
        if let Some(seconds) = header_i64(headers, "Retry-After") {
            return (seconds.max(0) as u64 * 1_000, None);
        }
        if let Some(reset) = header_i64(headers, "X-RateLimit-Reset") {
            let now = self.clock.now_ms();
            let wait = (reset * 1_000 - now).max(0) as u64 + 1_000;
            return (wait, Some(reset));
        }
        (FALLBACK_BACKOFF_MS, None)
    }

    /// Issue one cached, rate-limited, retried GET.
    pub async fn get(&self, req: &ApiRequest) -> Result<ApiResponse, GithubError> {
        let url = self.build_url(req)?;
        let key = cache_key("GET", url.as_str(), &req.accept);
        let cached = self.store.get_http_cache(&key)?;

        let mut rate_retries = 0u32;
        let mut server_retries = 0u32;

        loop {
            self.acquire_token(req.bucket).await;

            let mut builder = self.http.get(url.clone()).header(ACCEPT, req.accept.as_str());
            if let Some(entry) = &cached {
                if let Some(etag) = &entry.etag {
                    builder = builder.header(IF_NONE_MATCH, etag.as_str());
                }
                if let Some(last_modified) = &entry.last_modified {
                    builder = builder.header(IF_MODIFIED_SINCE, last_modified.as_str());
                }
            }

            let response = builder.send().await?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();

            if status == 304 {
                let entry = cached.as_ref().ok_or(GithubError::Http {
                    status,
                    body: "304 without cached entry".to_string(),
                })?;
                self.store.touch_http_cache(&key, self.clock.now_ms())?;
                return Ok(ApiResponse {
                    status: 200,
                    from_cache: true,
                    etag: entry.etag.clone(),
                    body: parse_body(&entry.body),
                });
            }

            if (200..300).contains(&status) {
                let bytes = response.bytes().await?.to_vec();
                let etag = header_string(&headers, "ETag");
                let last_modified = header_string(&headers, "Last-Modified");
                self.store.put_http_cache(&HttpCacheEntry {
                    key: key.clone(),
                    method: "GET".to_string(),
                    url: url.as_str().to_string(),
                    status,
                    etag: etag.clone(),
                    last_modified,
                    body: bytes.clone(),
                    fetched_at: self.clock.now_ms(),
                    expires_at: None,
                })?;
                return Ok(ApiResponse {
                    status,
                    from_cache: false,
                    etag,
                    body: parse_body(&bytes),
                });
            }

            if status == 429 || status == 403 {
                if rate_retries >= MAX_RATE_LIMIT_RETRIES {
                    return Err(GithubError::RateLimited {
                        bucket: req.bucket.as_str(),
                        retries: rate_retries,
                    });
                }
                let (wait_ms, reset_at) = self.upstream_wait(&headers);
                let reason = if status == 429 {
                    ThrottleReason::RateLimit429
                } else {
                    ThrottleReason::SecondaryRateLimit403
                };
                self.throttle.on_throttle(&ThrottleEvent {
                    bucket: req.bucket.as_str(),
                    wait_ms,
                    reason,
                    reset_at,
                });
                self.sleeper.sleep(Duration::from_millis(wait_ms)).await;
                rate_retries += 1;
                continue;
            }

            if status >= 500 {
                let body = response.text().await.unwrap_or_default();
                if server_retries >= MAX_SERVER_RETRIES {
                    return Err(GithubError::Http { status, body });
                }
                let backoff = Duration::from_secs(2u64.pow(server_retries));
                self.sleeper.sleep(backoff).await;
                server_retries += 1;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(GithubError::Http { status, body });
        }
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    pub async fn rate_limit(&self) -> Result<RateLimitResponse, GithubError> {
        let resp = self.get(&ApiRequest::new("/rate_limit")).await?;
        Ok(serde_json::from_value(resp.body)?)
    }

    pub async fn search_repositories(
        &self,
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<SearchRepositoriesResponse, GithubError> {
        let req = ApiRequest::new("/search/repositories")
            .bucket(Bucket::Search)
            .param("q", query)
            .param("sort", "stars")
            .param("order", "desc")
            .param("page", page.to_string())
            .param("per_page", per_page.to_string());
        let resp = self.get(&req).await?;
        Ok(serde_json::from_value(resp.body)?)
    }

    /// Fetch raw README content. `Ok(None)` on 404 (a missing README is not
    /// an error).
    pub async fn fetch_readme(&self, full_name: &str) -> Result<Option<ReadmeFetch>, GithubError> {
        let path = format!("/repos/{full_name}/readme");
        let req = ApiRequest::new(&path).accept(GITHUB_RAW).bucket(Bucket::Core);
        match self.get(&req).await {
            Ok(resp) => {
                let text = match resp.body {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                Ok(Some(ReadmeFetch {
                    text,
                    etag: resp.etag,
                    source_url: format!("{}{path}", self.base_url),
                }))
            }
            Err(GithubError::Http { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn parse_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}
