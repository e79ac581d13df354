//! Strict-JSON LLM chat client.
//!
//! Calls an OpenRouter-compatible chat-completions endpoint and guarantees
//! the returned payload is valid JSON that passes the caller's schema
//! validator. Anything short of that is retried up to three attempts with
//! exponential backoff.

pub mod prompts;
pub mod schema;

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::github::{Sleeper, TokioSleeper};

const MAX_ATTEMPTS: u32 = 3;
/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.2;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// 429 from the provider; retried with the advertised wait when present.
    #[error("llm rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Non-2xx other than 429. Not retried.
    #[error("llm provider error (http {status}): {body}")]
    Provider { status: u16, body: String },

    /// Transport-level JSON, missing content field, content that is not
    /// JSON, or schema validation failure. Retried; terminal after three
    /// attempts.
    #[error("invalid llm output: {message}")]
    InvalidOutput { message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::InvalidOutput { .. } => true,
            Self::Transport(_) => true,
            Self::Provider { .. } => false,
            Self::Config(_) => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Provider { .. } => "provider_error",
            Self::InvalidOutput { .. } => "invalid_output",
            Self::Transport(_) => "transport",
            Self::Config(_) => "config",
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

// =============================================================================
// Request types
// =============================================================================

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: 2_048,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = max;
        self
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

// =============================================================================
// Client
// =============================================================================

pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    sleeper: Arc<dyn Sleeper>,
}

impl LlmClient {
    pub fn new(base_url: impl Into<String>, api_key: &str) -> Result<Self, LlmError> {
        Self::with_sleeper(base_url, api_key, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        base_url: impl Into<String>,
        api_key: &str,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| LlmError::Config("invalid API key format".to_string()))?;
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| LlmError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            sleeper,
        })
    }

    /// One call, validated: the response content must be JSON and must pass
    /// `validate`. Schema failures count as invalid output and re-enter the
    /// retry loop.
    pub async fn chat_validated<T, F>(&self, req: &LlmRequest, validate: F) -> Result<T, LlmError>
    where
        F: Fn(&Value) -> Result<T, String>,
    {
        let mut last_error: Option<LlmError> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let outcome = match self.attempt(req).await {
                Ok(content) => validate(&content).map_err(|message| LlmError::InvalidOutput {
                    message,
                }),
                Err(err) => Err(err),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_retryable() || attempt == MAX_ATTEMPTS {
                        return Err(err);
                    }
                    let delay = err
                        .retry_after()
                        .unwrap_or_else(|| Duration::from_secs(2u64.pow(attempt - 1)));
                    last_error = Some(err);
                    self.sleeper.sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or(LlmError::InvalidOutput {
            message: "retries exhausted".to_string(),
        }))
    }

    /// The raw JSON content payload, unvalidated.
    pub async fn chat_json(&self, req: &LlmRequest) -> Result<Value, LlmError> {
        self.chat_validated(req, |value| Ok(value.clone())).await
    }

    async fn attempt(&self, req: &LlmRequest) -> Result<Value, LlmError> {
        let api_req = ChatApiRequest {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&api_req)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            // Drain the body so the connection can be reused.
            let _ = response.text().await;
            return Err(LlmError::RateLimited { retry_after });
        }
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider { status, body });
        }

        let body = response.text().await?;
        let parsed: ChatApiResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::InvalidOutput {
                message: format!("transport body not JSON: {e}"),
            })?;

        let content = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| LlmError::InvalidOutput {
                message: "response missing content field".to_string(),
            })?;

        serde_json::from_str(&content).map_err(|e| LlmError::InvalidOutput {
            message: format!("content not valid JSON: {e}"),
        })
    }
}
