//! URL-test history: the latest probe result per outbound tag.

use dashmap::DashMap;
use std::time::Instant;

/// One probe observation. A missing entry means "never probed"; staleness
/// is judged by the reader against its own interval.
#[derive(Debug, Clone, Copy)]
pub struct UrlTestHistory {
    pub time: Instant,
    pub delay: u16,
}

/// Tag-keyed store of the most recent probe per outbound. Written by the
/// prober, read by the candidate selector; per-entry atomic.
#[derive(Debug, Default)]
pub struct HistoryStore {
    entries: DashMap<String, UrlTestHistory>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, tag: &str) -> Option<UrlTestHistory> {
        self.entries.get(tag).map(|e| *e.value())
    }

    pub fn store(&self, tag: &str, history: UrlTestHistory) {
        self.entries.insert(tag.to_string(), history);
    }

    pub fn delete(&self, tag: &str) {
        self.entries.remove(tag);
    }
}
