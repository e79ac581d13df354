//! Versioned prompt registry.
//!
//! Prompts live on disk as one file per `(id, version)` with a JSON header
//! block between `---` delimiter lines, followed by the template body:
//!
//! ```text
//! ---
//! {"id": "repo_analysis", "version": "v1",
//!  "model_defaults": {"temperature": 0.2, "max_tokens": 2000},
//!  "schema_id": "RepoAnalysisOutput"}
//! ---
//! Analyze the repository {{full_name}} ...
//! ```
//!
//! Placeholder substitution uses `{{name}}`; unknown placeholders are left
//! intact (documented behavior, never an error).

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

pub const REPO_ANALYSIS_ID: &str = "repo_analysis";
pub const BRIEF_GENERATE_ID: &str = "brief_generate";
pub const DEFAULT_VERSION: &str = "v1";

const BUILTIN_REPO_ANALYSIS_V1: &str = include_str!("../../prompts/repo_analysis.v1.md");
const BUILTIN_BRIEF_GENERATE_V1: &str = include_str!("../../prompts/brief_generate.v1.md");

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed prompt header: {0}")]
    Header(String),
    #[error("prompt not found: {id}@{version}")]
    NotFound { id: String, version: String },
    #[error("prompt header mismatch: requested {requested}, header says {found}")]
    Mismatch { requested: String, found: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelDefaults {
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct PromptHeader {
    id: String,
    version: String,
    model_defaults: ModelDefaults,
    schema_id: String,
}

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub id: String,
    pub version: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub schema_id: String,
    pub body: String,
}

impl PromptTemplate {
    /// Substitute `{{name}}` placeholders. Unknown placeholders survive.
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        let mut out = self.body.clone();
        for (name, value) in vars {
            out = out.replace(&format!("{{{{{name}}}}}"), value);
        }
        out
    }
}

/// Parse one template file: `---` header block, JSON header, body.
pub fn parse_template(raw: &str) -> Result<PromptTemplate, PromptError> {
    let mut lines = raw.lines();
    match lines.next() {
        Some(line) if line.trim() == "---" => {}
        _ => {
            return Err(PromptError::Header(
                "template must start with a --- header block".to_string(),
            ))
        }
    }

    let mut header_lines = Vec::new();
    let mut body_start = None;
    let mut offset = raw.find('\n').map(|i| i + 1).unwrap_or(raw.len());
    for line in raw[offset..].lines() {
        let line_len = line.len() + 1;
        if line.trim() == "---" {
            body_start = Some(offset + line_len);
            break;
        }
        header_lines.push(line);
        offset += line_len;
    }
    let body_start =
        body_start.ok_or_else(|| PromptError::Header("unterminated --- header".to_string()))?;

    let header: PromptHeader = serde_json::from_str(&header_lines.join("\n"))
        .map_err(|e| PromptError::Header(e.to_string()))?;

    let body = raw.get(body_start..).unwrap_or("").trim_start().to_string();
    if body.is_empty() {
        return Err(PromptError::Header("empty template body".to_string()));
    }

    Ok(PromptTemplate {
        id: header.id,
        version: header.version,
        temperature: header.model_defaults.temperature,
        max_tokens: header.model_defaults.max_tokens,
        schema_id: header.schema_id,
        body,
    })
}

pub struct PromptRegistry {
    templates: HashMap<(String, String), PromptTemplate>,
}

impl PromptRegistry {
    /// The compiled-in templates.
    pub fn builtin() -> Self {
        let mut templates = HashMap::new();
        for raw in [BUILTIN_REPO_ANALYSIS_V1, BUILTIN_BRIEF_GENERATE_V1] {
            let template = parse_template(raw).expect("builtin template is well-formed");
            templates.insert((template.id.clone(), template.version.clone()), template);
        }
        Self { templates }
    }

    /// Builtins overlaid with `.md` templates from a directory. A file named
    /// `{id}.{version}.md` must carry a matching header.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, PromptError> {
        let mut registry = Self::builtin();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            let template = parse_template(&raw)?;
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                let expected = format!("{}.{}", template.id, template.version);
                if stem != expected {
                    return Err(PromptError::Mismatch {
                        requested: stem.to_string(),
                        found: expected,
                    });
                }
            }
            registry
                .templates
                .insert((template.id.clone(), template.version.clone()), template);
        }
        Ok(registry)
    }

    pub fn get(&self, id: &str, version: &str) -> Result<&PromptTemplate, PromptError> {
        self.templates
            .get(&(id.to_string(), version.to_string()))
            .ok_or_else(|| PromptError::NotFound {
                id: id.to_string(),
                version: version.to_string(),
            })
    }
}
