//! Environment-driven configuration.
//!
//! Everything tunable comes from the `CS_*` family plus the two upstream
//! credentials. `Config::from_env` never touches the network; `validate`
//! is what `doctor` runs before anything else.

use std::path::PathBuf;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Default GitHub REST endpoint.
pub const DEFAULT_GITHUB_BASE_URL: &str = "https://api.github.com";
/// Default OpenRouter-compatible chat completions endpoint.
pub const DEFAULT_LLM_BASE_URL: &str = "https://openrouter.ai/api/v1";
/// Default analysis model.
pub const DEFAULT_MODEL: &str = "anthropic/claude-3-5-haiku";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "fatal" => Some(Self::Fatal),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }

    /// Directive for the tracing EnvFilter. `fatal` has no tracing
    /// equivalent and filters at error; fatal conditions also exit non-zero.
    pub fn tracing_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error | Self::Fatal => "error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {name}: {message}")]
    Invalid { name: &'static str, message: String },
    #[error("{name} is required for live runs")]
    MissingCredential { name: &'static str },
}

impl ConfigError {
    fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            name,
            message: message.into(),
        }
    }
}

/// Process configuration, resolved once at startup and passed explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub log_level: LogLevel,
    pub github_token: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub github_base_url: String,
    pub llm_base_url: String,
    pub model: String,
    pub prompt_dir: Option<PathBuf>,
    pub policy_path: Option<PathBuf>,
    pub overlap_threshold: f64,
    pub overlap_exception_penalty: f64,
    pub top_opportunities: usize,
    pub history_candidates: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("CS_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".collab_scout.sqlite"));

        let log_level = match std::env::var("CS_LOG_LEVEL") {
            Ok(raw) => LogLevel::parse(&raw)
                .ok_or_else(|| ConfigError::invalid("CS_LOG_LEVEL", format!("unknown level {raw:?}")))?,
            Err(_) => LogLevel::Info,
        };

        let overlap_threshold = env_f64("CS_OVERLAP_THRESHOLD", 0.70)?;
        let overlap_exception_penalty = env_f64("CS_OVERLAP_EXCEPTION_PENALTY", 0.10)?;
        let top_opportunities = env_usize("CS_TOP_OPPORTUNITIES", 3)?;
        let history_candidates = env_usize("CS_HISTORY_CANDIDATES", 100)?;

        Ok(Self {
            db_path,
            log_level,
            github_token: non_empty_env("GITHUB_TOKEN"),
            openrouter_api_key: non_empty_env("OPENROUTER_API_KEY"),
            github_base_url: std::env::var("CS_GITHUB_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_GITHUB_BASE_URL.to_string()),
            llm_base_url: std::env::var("CS_LLM_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_LLM_BASE_URL.to_string()),
            model: std::env::var("CS_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            prompt_dir: std::env::var("CS_PROMPT_DIR").ok().map(PathBuf::from),
            policy_path: std::env::var("CS_POLICY_PATH").ok().map(PathBuf::from),
            overlap_threshold,
            overlap_exception_penalty,
            top_opportunities,
            history_candidates,
        })
    }

    /// Structural validation. `live` additionally requires both credentials.
    pub fn validate(&self, live: bool) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.overlap_threshold) {
            return Err(ConfigError::invalid(
                "CS_OVERLAP_THRESHOLD",
                "must be in [0, 2]",
            ));
        }
        if !(0.0..=1.0).contains(&self.overlap_exception_penalty) {
            return Err(ConfigError::invalid(
                "CS_OVERLAP_EXCEPTION_PENALTY",
                "must be in [0, 1]",
            ));
        }
        if self.github_base_url.trim().is_empty() {
            return Err(ConfigError::invalid("CS_GITHUB_BASE_URL", "must be non-empty"));
        }
        if self.llm_base_url.trim().is_empty() {
            return Err(ConfigError::invalid("CS_LLM_BASE_URL", "must be non-empty"));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::invalid("CS_MODEL", "must be non-empty"));
        }
        if live {
            if self.github_token.is_none() {
                return Err(ConfigError::MissingCredential {
                    name: "GITHUB_TOKEN",
                });
            }
            if self.openrouter_api_key.is_none() {
                return Err(ConfigError::MissingCredential {
                    name: "OPENROUTER_API_KEY",
                });
            }
        }
        Ok(())
    }

    /// Non-secret configuration as canonical JSON. serde_json orders map
    /// keys lexicographically, which is the normalization the hash relies on.
    pub fn non_secret_json(&self) -> serde_json::Value {
        serde_json::json!({
            "db_path": self.db_path.display().to_string(),
            "github_base_url": self.github_base_url,
            "history_candidates": self.history_candidates,
            "llm_base_url": self.llm_base_url,
            "log_level": self.log_level.as_str(),
            "model": self.model,
            "overlap_exception_penalty": self.overlap_exception_penalty,
            "overlap_threshold": self.overlap_threshold,
            "top_opportunities": self.top_opportunities,
        })
    }

    /// 16-hex-char truncated SHA-256 of the normalized non-secret config.
    pub fn short_hash(&self) -> String {
        let canonical =
            serde_json::to_string(&self.non_secret_json()).unwrap_or_else(|_| "{}".to_string());
        let digest = Sha256::digest(canonical.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        hex[..16].to_string()
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<f64>()
            .map_err(|_| ConfigError::invalid(name, format!("not a number: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn env_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| ConfigError::invalid(name, format!("not an integer: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            db_path: PathBuf::from("scout.sqlite"),
            log_level: LogLevel::Info,
            github_token: Some("t".into()),
            openrouter_api_key: Some("k".into()),
            github_base_url: DEFAULT_GITHUB_BASE_URL.into(),
            llm_base_url: DEFAULT_LLM_BASE_URL.into(),
            model: DEFAULT_MODEL.into(),
            prompt_dir: None,
            policy_path: None,
            overlap_threshold: 0.70,
            overlap_exception_penalty: 0.10,
            top_opportunities: 3,
            history_candidates: 100,
        }
    }

    #[test]
    fn short_hash_is_16_hex_chars_and_stable() {
        let cfg = base_config();
        let h1 = cfg.short_hash();
        let h2 = cfg.short_hash();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn short_hash_ignores_secrets() {
        let mut a = base_config();
        let mut b = base_config();
        a.github_token = Some("AAA".into());
        b.github_token = Some("BBB".into());
        assert_eq!(a.short_hash(), b.short_hash());
    }

    #[test]
    fn validate_requires_credentials_for_live() {
        let mut cfg = base_config();
        cfg.github_token = None;
        assert!(cfg.validate(false).is_ok());
        assert!(matches!(
            cfg.validate(true),
            Err(ConfigError::MissingCredential { name: "GITHUB_TOKEN" })
        ));
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let mut cfg = base_config();
        cfg.overlap_threshold = -0.1;
        assert!(cfg.validate(false).is_err());
    }

    #[test]
    fn log_level_parsing() {
        assert_eq!(LogLevel::parse("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("fatal"), Some(LogLevel::Fatal));
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!(LogLevel::Fatal.tracing_directive(), "error");
    }
}
