use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::warn;
use uuid::Uuid;

use crate::config::DEFAULT_DIAGNOSTICS_CAPACITY;

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub id: Uuid,
    pub source: String,
    pub message: String,
    pub context: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Where transport, parse, and fetch failures are reported.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, source: &str, message: &str, context: Option<serde_json::Value>);
}

/// Size-bounded diagnostic log shared by every component; newest first.
pub struct DiagnosticLog {
    entries: Mutex<VecDeque<Diagnostic>>,
    capacity: usize,
}

impl DiagnosticLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn entries(&self) -> Vec<Diagnostic> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::new(DEFAULT_DIAGNOSTICS_CAPACITY)
    }
}

impl DiagnosticSink for DiagnosticLog {
    fn report(&self, source: &str, message: &str, context: Option<serde_json::Value>) {
        warn!(source, message, "Diagnostic recorded");
        let entry = Diagnostic {
            id: Uuid::new_v4(),
            source: source.to_string(),
            message: message.to_string(),
            context,
            timestamp: Utc::now(),
        };
        let mut entries = self.entries.lock();
        entries.push_front(entry);
        entries.truncate(self.capacity);
    }
}
