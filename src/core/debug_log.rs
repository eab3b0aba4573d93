//! Bounded diagnostic trail shared by every engine component.
//!
//! Entries are appended in order and the oldest entry is evicted once the
//! buffer holds `capacity` entries. Each entry is mirrored to `tracing` and to
//! an optional caller-registered observer.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::core::realtime::now_millis;

/// Default number of retained entries.
pub const DEFAULT_DEBUG_LOG_CAPACITY: usize = 100;

/// Severity of a debug log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "info"),
            LogLevel::Success => write!(f, "success"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// One diagnostic record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugLogEntry {
    pub level: LogLevel,
    pub message: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Callback for debug log entries.
pub type DebugLogCallback = Arc<dyn Fn(&DebugLogEntry) + Send + Sync>;

/// Cheaply clonable handle to the shared ring buffer.
#[derive(Clone)]
pub struct DebugLog {
    inner: Arc<DebugLogInner>,
}

struct DebugLogInner {
    capacity: usize,
    entries: Mutex<VecDeque<DebugLogEntry>>,
    observer: RwLock<Option<DebugLogCallback>>,
}

impl DebugLog {
    /// Create a buffer retaining at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(DebugLogInner {
                capacity,
                entries: Mutex::new(VecDeque::with_capacity(capacity)),
                observer: RwLock::new(None),
            }),
        }
    }

    /// Register the observer invoked for every appended entry.
    pub fn set_observer(&self, callback: DebugLogCallback) {
        *self.inner.observer.write() = Some(callback);
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Append an entry, evicting the oldest one when full.
    pub fn push(&self, level: LogLevel, message: impl Into<String>, data: Option<serde_json::Value>) {
        let entry = DebugLogEntry {
            level,
            message: message.into(),
            timestamp: now_millis(),
            data,
        };

        match level {
            LogLevel::Info => tracing::info!(data = ?entry.data, "{}", entry.message),
            LogLevel::Success => {
                tracing::info!(outcome = "success", data = ?entry.data, "{}", entry.message)
            }
            LogLevel::Warn => tracing::warn!(data = ?entry.data, "{}", entry.message),
            LogLevel::Error => tracing::error!(data = ?entry.data, "{}", entry.message),
        }

        {
            let mut entries = self.inner.entries.lock();
            while entries.len() >= self.inner.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        // Observer runs outside the buffer lock so it may read the log itself.
        let observer = self.inner.observer.read().clone();
        if let Some(cb) = observer {
            cb(&entry);
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(LogLevel::Info, message, None);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.push(LogLevel::Success, message, None);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message, None);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(LogLevel::Error, message, None);
    }

    /// Snapshot of the retained entries, oldest first.
    pub fn entries(&self) -> Vec<DebugLogEntry> {
        self.inner.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }
}

impl Default for DebugLog {
    fn default() -> Self {
        Self::new(DEFAULT_DEBUG_LOG_CAPACITY)
    }
}

impl fmt::Debug for DebugLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugLog")
            .field("capacity", &self.inner.capacity)
            .field("len", &self.len())
            .finish()
    }
}
