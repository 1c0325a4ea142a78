use std::collections::VecDeque;

use tokio::sync::Mutex;
use tracing::debug;

use crate::types::LogEntry;

/// Default number of entries kept in memory.
pub const DEFAULT_CAPACITY: usize = 100;

/// Bounded, process-lifetime log of inbound request metadata.
///
/// Oldest entries are evicted first once `capacity` is exceeded.
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `entry` and trim the front back down to `capacity`.
    pub async fn record(&self, entry: LogEntry) {
        let mut guard = self.entries.lock().await;
        guard.push_back(entry);
        while guard.len() > self.capacity {
            guard.pop_front();
        }
        debug!(len = guard.len(), "event recorded");
    }

    /// The `n` most recent entries, oldest first.
    pub async fn recent(&self, n: usize) -> Vec<LogEntry> {
        let guard = self.entries.lock().await;
        let skip = guard.len().saturating_sub(n);
        guard.iter().skip(skip).cloned().collect()
    }

    pub async fn all(&self) -> Vec<LogEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
