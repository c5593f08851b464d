//! Bounded in-memory buffer of operator-visible log lines.
//!
//! The dashboard polls `/api/logs`, so the interesting subset of what goes to
//! `tracing` is also recorded here. The buffer keeps the newest `capacity`
//! entries and drops the oldest.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Default number of retained entries.
const DEFAULT_CAPACITY: usize = 10_000;

/// Severity of a stored log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// One stored log line.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Cloneable handle to the shared log buffer.
#[derive(Clone)]
pub struct LogStore {
    entries: Arc<RwLock<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl LogStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            capacity,
        }
    }

    /// Record a line and emit the matching `tracing` event.
    pub fn record(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warning => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }

        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.push_back(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        });
        while self.capacity > 0 && entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.record(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.record(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.record(LogLevel::Error, message);
    }

    /// Copy of the current entries, oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.iter().cloned().collect()
    }

    pub fn clear(&self) {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.clear();
    }

    pub fn len(&self) -> usize {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let store = LogStore::new();
        store.info("one");
        store.warn("two");

        let entries = store.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[0].message, "one");
        assert_eq!(entries[1].level, LogLevel::Warning);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let store = LogStore::with_capacity(3);
        for i in 0..5 {
            store.info(format!("line {i}"));
        }

        let entries = store.snapshot();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "line 2");
        assert_eq!(entries[2].message, "line 4");
    }

    #[test]
    fn test_clear() {
        let store = LogStore::new();
        store.error("boom");
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_level_serializes_lowercase() {
        let json = serde_json::to_string(&LogLevel::Warning).unwrap();
        assert_eq!(json, "\"warning\"");
    }
}
