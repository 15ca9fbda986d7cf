//! Credential masking for anything that ends up in logs.
//!
//! Cache payloads and usage metadata are caller supplied and may carry API
//! keys, bearer tokens or connection strings. Log them only through
//! [`redact`], [`redact_json`] or [`preview`].

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

pub const MASK: &str = "[REDACTED]";

const SENSITIVE_KEYS: &[&str] = &[
    "api_key",
    "apikey",
    "access_token",
    "refresh_token",
    "token",
    "secret",
    "client_secret",
    "password",
    "passwd",
    "authorization",
    "cookie",
    "credential",
    "credentials",
    "private_key",
    "service_role_key",
];

fn secret_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // Provider keys: sk-..., gsk_..., sk-ant-...
            r"\b(?:sk|gsk|rk|pk)[-_][A-Za-z0-9_\-]{12,}",
            // JWTs (Supabase service keys, session tokens)
            r"\beyJ[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+",
            // Authorization headers
            r"(?i)\bbearer\s+[A-Za-z0-9._~+/=\-]+",
            // key=value / "key": "value" pairs with sensitive names
            r#"(?i)\b(api[_-]?key|access[_-]?token|secret|password|passwd|token)\b("?\s*[:=]\s*"?)[^\s",}&]+"#,
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid redaction regex"))
        .collect()
    })
}

fn url_credentials_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b([a-z][a-z0-9+.\-]*://)[^/\s:@]+:[^/\s@]+@").expect("valid url regex")
    })
}

/// Mask credential-like substrings.
pub fn redact(text: &str) -> String {
    let mut result = url_credentials_regex()
        .replace_all(text, format!("${{1}}{}@", MASK))
        .into_owned();

    for (idx, pattern) in secret_patterns().iter().enumerate() {
        result = if idx == secret_patterns().len() - 1 {
            pattern
                .replace_all(&result, format!("${{1}}${{2}}{}", MASK))
                .into_owned()
        } else {
            pattern.replace_all(&result, MASK).into_owned()
        };
    }

    result
}

/// Mask values stored under sensitive keys and scrub every string.
pub fn redact_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let masked = if is_sensitive_key(k) {
                        Value::String(MASK.to_string())
                    } else {
                        redact_json(v)
                    };
                    (k.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_json).collect()),
        Value::String(s) => Value::String(redact(s)),
        other => other.clone(),
    }
}

/// Redacted, length-bounded rendering for log lines.
pub fn preview(text: &str, max_chars: usize) -> String {
    let redacted = redact(text);
    if redacted.chars().count() <= max_chars {
        return redacted;
    }
    let truncated: String = redacted.chars().take(max_chars).collect();
    format!("{}... ({} chars)", truncated, redacted.chars().count())
}

fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase().replace('-', "_");
    SENSITIVE_KEYS.iter().any(|s| normalized == *s)
        || normalized.ends_with("_secret")
        || normalized.ends_with("_password")
        || normalized.ends_with("_api_key")
}
