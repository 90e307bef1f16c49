// =============================================================================
// Event Log — bounded ring buffer of operational/trading events (A3)
// =============================================================================
//
// The concrete disk-writing implementation is out of scope; `flush()` only
// drains the buffer and returns what it drained, the way a caller would then
// hand to a real sink. Capacity and flush cadence are the in-scope contract
// (§2 A3, §7).
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Severity of one logged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// One operational/trading event (open, close, fallback fire, PnL report,
/// error) captured for later flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    pub level: EventLevel,
    pub message: String,
}

/// Bounded ring buffer: pushing past `capacity` evicts the oldest record.
pub struct EventLog {
    capacity: usize,
    records: Mutex<VecDeque<EventRecord>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, level: EventLevel, message: impl Into<String>) {
        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(EventRecord {
            at: Utc::now(),
            level,
            message: message.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains every buffered record (oldest first) for a periodic flush
    /// (every 5s per the scheduler, §5). Callers own writing them to disk.
    pub fn flush(&self) -> Vec<EventRecord> {
        self.records.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_evicts_oldest_past_capacity() {
        let log = EventLog::new(2);
        log.push(EventLevel::Info, "a");
        log.push(EventLevel::Info, "b");
        log.push(EventLevel::Info, "c");
        assert_eq!(log.len(), 2);
        let drained = log.flush();
        assert_eq!(drained[0].message, "b");
        assert_eq!(drained[1].message, "c");
    }

    #[test]
    fn flush_drains_and_empties_the_buffer() {
        let log = EventLog::new(10);
        log.push(EventLevel::Error, "boom");
        assert_eq!(log.len(), 1);
        let drained = log.flush();
        assert_eq!(drained.len(), 1);
        assert!(log.is_empty());
    }
}
