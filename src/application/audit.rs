//! Leveled audit log.
//!
//! Entries are sanitised, serialised as JSON lines and handed to a
//! [`LogSink`]. When the sink is missing or fails, the entry is forwarded to
//! `tracing` instead (target `access_guard::audit`), so an unwritable log
//! never fails the caller and never re-enters the audit log.

use crate::application::ports::{Clock, LogFileInfo, LogSink};
use crate::domain::entry::{LogEntry, LogLevel, Sanitizer};
use crate::error::ConfigError;
use crate::infrastructure::clock::SystemClock;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Audit log shared by the rate limiter and the session service.
#[derive(Debug)]
pub struct AuditLog {
    sink: Option<Arc<dyn LogSink>>,
    min_level: LogLevel,
    sanitizer: Sanitizer,
    clock: Arc<dyn Clock>,
    fallbacks: AtomicU64,
}

/// Builder for [`AuditLog`].
#[derive(Debug)]
pub struct AuditLogBuilder {
    sink: Option<Arc<dyn LogSink>>,
    min_level: LogLevel,
    max_context_len: usize,
    clock: Option<Arc<dyn Clock>>,
}

impl AuditLogBuilder {
    /// Write entries to `sink`. Without a sink, every entry goes to `tracing`.
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Drop entries below `level` (default: `Info`).
    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Truncate context values longer than `len` characters (default: 256).
    pub fn with_max_context_len(mut self, len: usize) -> Self {
        self.max_context_len = len;
        self
    }

    /// Clock used for entry timestamps (default: system clock).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the audit log.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidAudit`] when the context length is zero.
    pub fn build(self) -> Result<AuditLog, ConfigError> {
        if self.max_context_len == 0 {
            return Err(ConfigError::InvalidAudit(
                "max_context_len must be greater than 0".to_string(),
            ));
        }
        Ok(AuditLog {
            sink: self.sink,
            min_level: self.min_level,
            sanitizer: Sanitizer::new(self.max_context_len),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock::new())),
            fallbacks: AtomicU64::new(0),
        })
    }
}

impl AuditLog {
    /// Start building an audit log: no sink, `Info` minimum, 256-character
    /// context values.
    pub fn builder() -> AuditLogBuilder {
        AuditLogBuilder {
            sink: None,
            min_level: LogLevel::Info,
            max_context_len: Sanitizer::default().max_context_len(),
            clock: None,
        }
    }

    /// An audit log with no file: every entry is forwarded to `tracing`.
    pub fn tracing_only() -> Self {
        Self {
            sink: None,
            min_level: LogLevel::Info,
            sanitizer: Sanitizer::default(),
            clock: Arc::new(SystemClock::new()),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Minimum level that is recorded.
    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    /// Record an entry.
    ///
    /// Never fails: if the sink cannot take the entry it goes to `tracing`.
    pub fn append(
        &self,
        level: LogLevel,
        category: &str,
        message: &str,
        context: &[(&str, String)],
    ) {
        if level < self.min_level {
            return;
        }

        let entry = self.build_entry(level, category, message, context);
        let Some(sink) = &self.sink else {
            self.fallback(&entry, None);
            return;
        };

        match serde_json::to_string(&entry) {
            Ok(line) => {
                if let Err(e) = sink.write_line(&line) {
                    self.fallback(&entry, Some(&e.to_string()));
                }
            }
            Err(e) => self.fallback(&entry, Some(&e.to_string())),
        }
    }

    /// Record a `Debug` entry.
    pub fn debug(&self, category: &str, message: &str, context: &[(&str, String)]) {
        self.append(LogLevel::Debug, category, message, context);
    }

    /// Record an `Info` entry.
    pub fn info(&self, category: &str, message: &str, context: &[(&str, String)]) {
        self.append(LogLevel::Info, category, message, context);
    }

    /// Record a `Warning` entry.
    pub fn warning(&self, category: &str, message: &str, context: &[(&str, String)]) {
        self.append(LogLevel::Warning, category, message, context);
    }

    /// Record an `Error` entry.
    pub fn error(&self, category: &str, message: &str, context: &[(&str, String)]) {
        self.append(LogLevel::Error, category, message, context);
    }

    /// Record a `Critical` entry.
    pub fn critical(&self, category: &str, message: &str, context: &[(&str, String)]) {
        self.append(LogLevel::Critical, category, message, context);
    }

    /// Log files managed by the sink. Empty when there is no sink.
    pub fn list_files(&self) -> std::io::Result<Vec<LogFileInfo>> {
        match &self.sink {
            Some(sink) => sink.list_files(),
            None => Ok(Vec::new()),
        }
    }

    /// Number of entries that were diverted to `tracing`.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    fn build_entry(
        &self,
        level: LogLevel,
        category: &str,
        message: &str,
        context: &[(&str, String)],
    ) -> LogEntry {
        let context: BTreeMap<String, String> = context
            .iter()
            .map(|(key, value)| ((*key).to_string(), self.sanitizer.context_value(key, value)))
            .collect();
        LogEntry {
            timestamp: DateTime::<Utc>::from(self.clock.now())
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            level,
            category: category.to_string(),
            message: self.sanitizer.message(message),
            context,
        }
    }

    fn fallback(&self, entry: &LogEntry, sink_error: Option<&str>) {
        if sink_error.is_some() {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
        }
        let category = entry.category.as_str();
        let context = &entry.context;
        match entry.level {
            LogLevel::Debug => {
                tracing::debug!(
                    target: "access_guard::audit",
                    category,
                    ?context,
                    sink_error,
                    "{}",
                    entry.message
                )
            }
            LogLevel::Info => {
                tracing::info!(
                    target: "access_guard::audit",
                    category,
                    ?context,
                    sink_error,
                    "{}",
                    entry.message
                )
            }
            LogLevel::Warning => {
                tracing::warn!(
                    target: "access_guard::audit",
                    category,
                    ?context,
                    sink_error,
                    "{}",
                    entry.message
                )
            }
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(
                    target: "access_guard::audit",
                    category,
                    ?context,
                    sink_error,
                    critical = entry.level == LogLevel::Critical,
                    "{}",
                    entry.message
                )
            }
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::tracing_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct VecSink {
        lines: Mutex<Vec<String>>,
    }

    impl LogSink for VecSink {
        fn write_line(&self, line: &str) -> io::Result<()> {
            self.lines.lock().unwrap().push(line.to_string());
            Ok(())
        }

        fn list_files(&self) -> io::Result<Vec<LogFileInfo>> {
            Ok(Vec::new())
        }
    }

    #[derive(Debug)]
    struct BrokenSink;

    impl LogSink for BrokenSink {
        fn write_line(&self, _line: &str) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
        }

        fn list_files(&self) -> io::Result<Vec<LogFileInfo>> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
        }
    }

    fn entries(sink: &VecSink) -> Vec<LogEntry> {
        sink.lines
            .lock()
            .unwrap()
            .iter()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_entries_are_written_as_json_lines() {
        let sink = Arc::new(VecSink::default());
        let log = AuditLog::builder().with_sink(sink.clone()).build().unwrap();

        log.warning("rate_limit", "caller blocked", &[("action", "search".to_string())]);

        let written = entries(&sink);
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].level, LogLevel::Warning);
        assert_eq!(written[0].category, "rate_limit");
        assert_eq!(written[0].context["action"], "search");
        assert!(written[0].timestamp.ends_with('Z'));
    }

    #[test]
    fn test_entries_below_min_level_are_dropped() {
        let sink = Arc::new(VecSink::default());
        let log = AuditLog::builder()
            .with_sink(sink.clone())
            .with_min_level(LogLevel::Warning)
            .build()
            .unwrap();

        log.debug("x", "debug", &[]);
        log.info("x", "info", &[]);
        log.error("x", "error", &[]);

        let written = entries(&sink);
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].level, LogLevel::Error);
    }

    #[test]
    fn test_context_is_sanitised() {
        let sink = Arc::new(VecSink::default());
        let log = AuditLog::builder()
            .with_sink(sink.clone())
            .with_max_context_len(4)
            .build()
            .unwrap();

        log.info(
            "session",
            "loaded /srv/app/config.toml",
            &[("token", "secret-value".to_string()), ("query", "abcdefgh".to_string())],
        );

        let written = entries(&sink);
        assert_eq!(written[0].message, "loaded [path]");
        assert_eq!(written[0].context["token"], "[redacted]");
        assert!(written[0].context["query"].starts_with("abcd"));
        assert!(!written[0].context["query"].contains("efgh"));
    }

    #[test]
    fn test_broken_sink_falls_back_without_panicking() {
        let log = AuditLog::builder().with_sink(Arc::new(BrokenSink)).build().unwrap();
        log.error("store", "cache unreachable", &[]);
        log.critical("store", "cache unreachable", &[]);
        assert_eq!(log.fallback_count(), 2);
        assert!(log.list_files().is_err());
    }

    #[test]
    fn test_zero_context_len_is_rejected() {
        assert!(matches!(
            AuditLog::builder().with_max_context_len(0).build(),
            Err(ConfigError::InvalidAudit(_))
        ));
    }
}
