use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static ANSI_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("valid ansi escape regex"));

static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r#"(?i)"?(api[_-]?key|model[_-]?key|token|secret|password)"?\s*[:=]\s*["']?([A-Za-z0-9_\-\.]{6,})["']?"#)
            .expect("valid regex"),
        Regex::new(r"\b(sk-[A-Za-z0-9]{20,})\b").expect("valid regex"),
        Regex::new(r"\b(AKIA[0-9A-Z]{16})\b").expect("valid regex"),
        Regex::new(r"\b([A-Fa-f0-9]{32,})\b").expect("valid regex"),
    ]
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RedactionResult {
    pub content: String,
    pub redaction_count: usize,
}

/// Masks credentials before helper output or request payloads reach the log.
/// The helper is handed model keys (`model_key` command) and echoes them in
/// tracebacks often enough that nothing it prints is logged raw.
#[derive(Debug, Default, Clone)]
pub struct Redactor {
    aggressive: bool,
}

impl Redactor {
    pub fn new(aggressive: bool) -> Self {
        Self { aggressive }
    }

    pub fn redact(&self, input: &str) -> RedactionResult {
        let mut result = strip_ansi(input);
        if result.is_empty() {
            return RedactionResult {
                content: result,
                redaction_count: 0,
            };
        }

        let mut redaction_count = 0usize;
        if self.aggressive {
            result = result
                .split(' ')
                .map(|token| {
                    if token.len() > 48 && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                        redaction_count += 1;
                        "[REDACTED_LONG_TOKEN]".to_string()
                    } else {
                        token.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");
        }

        for pattern in SECRET_PATTERNS.iter() {
            let matches = pattern.find_iter(&result).count();
            if matches == 0 {
                continue;
            }

            redaction_count += matches;
            result = pattern
                .replace_all(&result, |caps: &regex::Captures<'_>| {
                    if caps.len() > 2 {
                        let key = caps
                            .get(1)
                            .map(|m| m.as_str())
                            .unwrap_or("secret")
                            .to_ascii_lowercase();
                        format!("{}=[REDACTED]", key)
                    } else {
                        "[REDACTED]".to_string()
                    }
                })
                .to_string();
        }

        RedactionResult {
            content: result,
            redaction_count,
        }
    }

    /// Log-safe rendering of a request payload.
    pub fn redact_json(&self, value: &serde_json::Value) -> String {
        self.redact(&value.to_string()).content
    }
}

pub fn strip_ansi(input: &str) -> String {
    ANSI_ESCAPE_RE.replace_all(input, "").to_string()
}
