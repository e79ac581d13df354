//! Secret redaction for audit events, logs and exported bundles.
//!
//! Pure function: walks arbitrary JSON structures and blanks any string value
//! whose *key name* looks sensitive. Runs before every write to the audit
//! table, every log line with structured data, and every export.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Replacement sentinel for redacted values.
pub const REDACTED: &str = "[REDACTED]";

static SENSITIVE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(token|key|secret|password|authorization)").expect("valid redaction pattern")
});

/// Return a copy of `value` with sensitive string values replaced.
///
/// A mapping entry is redacted when its key matches the sensitive pattern and
/// its value is a non-empty string. Everything else (including empty strings,
/// numbers and nulls under sensitive keys) passes through; nested maps and
/// sequences are recursed into.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if SENSITIVE_KEY.is_match(k) {
                    match v {
                        Value::String(s) if !s.is_empty() => {
                            out.insert(k.clone(), Value::String(REDACTED.to_string()));
                        }
                        other => {
                            out.insert(k.clone(), redact(other));
                        }
                    }
                } else {
                    out.insert(k.clone(), redact(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        primitive => primitive.clone(),
    }
}

/// Redact in place, avoiding a clone for large payloads.
pub fn redact_in_place(value: &mut Value) {
    let redacted = redact(value);
    *value = redacted;
}
