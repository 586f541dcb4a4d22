//! Audit log entries and the sanitising rules applied before they are written.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Audit severity. Totally ordered: `Debug < Info < Warning < Error < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    #[serde(alias = "debug")]
    Debug,
    #[serde(alias = "info")]
    Info,
    #[serde(alias = "warning", alias = "warn", alias = "WARN")]
    Warning,
    #[serde(alias = "error")]
    Error,
    #[serde(alias = "critical")]
    Critical,
}

impl LogLevel {
    /// Upper-case name as written to the log.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
    pub level: LogLevel,
    pub category: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

/// Replacement for context values under secret-looking keys.
pub const REDACTED: &str = "[redacted]";
/// Replacement for absolute filesystem paths.
pub const PATH_PLACEHOLDER: &str = "[path]";
/// Marker appended to truncated context values.
pub const TRUNCATION_MARKER: &str = "…[truncated]";

const SECRET_KEY_FRAGMENTS: [&str; 5] = ["token", "password", "secret", "cookie", "session_id"];

/// Rules that keep secrets and server paths out of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sanitizer {
    max_context_len: usize,
}

impl Sanitizer {
    /// Rules truncating context values after `max_context_len` characters.
    pub fn new(max_context_len: usize) -> Self {
        Self { max_context_len }
    }

    pub fn max_context_len(&self) -> usize {
        self.max_context_len
    }

    /// Clean a message: absolute paths are replaced.
    pub fn message(&self, message: &str) -> String {
        redact_paths(message)
    }

    /// Clean one context value for `key`.
    pub fn context_value(&self, key: &str, value: &str) -> String {
        let lowered = key.to_ascii_lowercase();
        if SECRET_KEY_FRAGMENTS
            .iter()
            .any(|fragment| lowered.contains(fragment))
        {
            return REDACTED.to_string();
        }
        let cleaned = redact_paths(value);
        if cleaned.chars().count() > self.max_context_len {
            let mut truncated: String = cleaned.chars().take(self.max_context_len).collect();
            truncated.push_str(TRUNCATION_MARKER);
            truncated
        } else {
            cleaned
        }
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(256)
    }
}

fn looks_like_absolute_path(token: &str) -> bool {
    let trimmed =
        token.trim_matches(|c: char| matches!(c, '"' | '\'' | '(' | ')' | ',' | ';' | '`'));
    let bytes = trimmed.as_bytes();
    let windows_drive = bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/');
    if windows_drive {
        return true;
    }
    trimmed.starts_with('/') && trimmed[1..].contains('/') && !trimmed.starts_with("//")
}

/// Characters after which a path may start inside a word (`file=/x`, `path:/x`).
const PATH_DELIMITERS: &[u8] = b"=:([{\"',;<>";

/// The word with its absolute path (if any) replaced, keeping the key before it.
fn redact_word(word: &str) -> Option<String> {
    let bytes = word.as_bytes();
    let start = (0..bytes.len()).find(|&i| {
        let at_boundary = i == 0 || PATH_DELIMITERS.contains(&bytes[i - 1]);
        at_boundary && looks_like_absolute_path(&word[i..])
    })?;
    Some(format!("{}{}", &word[..start], PATH_PLACEHOLDER))
}

fn redact_paths(text: &str) -> String {
    if !text.contains('/') && !text.contains('\\') {
        return text.to_string();
    }
    let mut redacted = String::with_capacity(text.len());
    for piece in text.split_inclusive(char::is_whitespace) {
        let word = piece.trim_end_matches(char::is_whitespace);
        match redact_word(word) {
            Some(clean) => {
                redacted.push_str(&clean);
                redacted.push_str(&piece[word.len()..]);
            }
            None => redacted.push_str(piece),
        }
    }
    redacted
}
