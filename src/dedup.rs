use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// Message ids seen within the retention horizon.
///
/// Entries are only removed by [`DedupStore::sweep`], so an id recorded at `t`
/// is reported as seen at least until `t + ttl`. Memory stays bounded by
/// arrival rate times `ttl` as long as the owner sweeps periodically.
#[derive(Debug)]
pub struct DedupStore {
    ttl: Duration,
    entries: HashMap<String, DateTime<Utc>>,
}

impl DedupStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn seen(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Track `id` from `now`. Re-recording a tracked id keeps its first timestamp.
    pub fn record(&mut self, id: &str, now: DateTime<Utc>) {
        self.entries.entry(id.to_string()).or_insert(now);
    }

    /// Drop every entry whose age exceeds the ttl. Returns how many were removed.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, first_seen| now - *first_seen <= ttl);
        before - self.entries.len()
    }

    /// Number of ids currently tracked.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn first_seen(&self, id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(id).copied()
    }
}
