//! Structured lifecycle records.
//!
//! Every pool operation worth explaining leaves a [`RuntimeLogRecord`] in a
//! bounded ring. Records below the configured level are dropped at the source.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Records kept before the oldest are discarded.
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

/// Lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// One lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeLogRecord {
    /// Monotonic record id.
    pub decision_id: u64,
    /// Correlation id: `poolguard::<symbol>::<decision_id:016x>`.
    pub trace_id: String,
    pub level: LogLevel,
    /// Entry point (`pool_alloc`, `check_bounds`, ...).
    pub symbol: String,
    /// Event kind (`alloc`, `rewrite`, `violation`, ...).
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptr: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: String,
    pub details: String,
}

/// Bounded ring of lifecycle records.
#[derive(Debug)]
pub struct EventLog {
    threshold: LogLevel,
    capacity: usize,
    next_id: u64,
    dropped: u64,
    records: VecDeque<RuntimeLogRecord>,
}

/// Builder-side view of a record before it gets an id.
#[derive(Debug, Clone, Copy)]
pub struct Event<'a> {
    pub level: LogLevel,
    pub symbol: &'a str,
    pub event: &'a str,
    pub pool: Option<u32>,
    pub ptr: Option<usize>,
    pub size: Option<usize>,
    pub outcome: &'a str,
}

impl<'a> Event<'a> {
    #[must_use]
    pub fn new(level: LogLevel, symbol: &'a str, event: &'a str, outcome: &'a str) -> Self {
        Self {
            level,
            symbol,
            event,
            pool: None,
            ptr: None,
            size: None,
            outcome,
        }
    }

    #[must_use]
    pub fn pool(mut self, pool: Option<u32>) -> Self {
        self.pool = pool;
        self
    }

    #[must_use]
    pub fn ptr(mut self, ptr: usize) -> Self {
        self.ptr = Some(ptr);
        self
    }

    #[must_use]
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }
}

impl EventLog {
    #[must_use]
    pub fn new(threshold: LogLevel) -> Self {
        Self::with_capacity(threshold, DEFAULT_EVENT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(threshold: LogLevel, capacity: usize) -> Self {
        Self {
            threshold,
            capacity: capacity.max(1),
            next_id: 1,
            dropped: 0,
            records: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.threshold
    }

    /// Append a record, returning its id (`None` when filtered out).
    pub fn record(&mut self, event: Event<'_>, details: impl FnOnce() -> String) -> Option<u64> {
        if !self.enabled(event.level) {
            return None;
        }
        let decision_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        if self.records.len() == self.capacity {
            self.records.pop_front();
            self.dropped += 1;
        }
        self.records.push_back(RuntimeLogRecord {
            decision_id,
            trace_id: format!("poolguard::{}::{decision_id:016x}", event.symbol),
            level: event.level,
            symbol: event.symbol.to_string(),
            event: event.event.to_string(),
            pool: event.pool,
            ptr: event.ptr,
            size: event.size,
            outcome: event.outcome.to_string(),
            details: details(),
        });
        Some(decision_id)
    }

    /// Remove and return every buffered record.
    pub fn drain(&mut self) -> Vec<RuntimeLogRecord> {
        self.records.drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records discarded because the ring was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_below_threshold_are_dropped() {
        let mut log = EventLog::new(LogLevel::Info);
        assert!(
            log.record(Event::new(LogLevel::Trace, "pool_alloc", "alloc", "ok"), || {
                unreachable!("details are not built for filtered records")
            })
            .is_none()
        );
        let id = log
            .record(
                Event::new(LogLevel::Warn, "check_bounds", "rewrite", "exhausted").ptr(0x10),
                || "token region full".to_string(),
            )
            .unwrap();
        assert_eq!(id, 1);
        let records = log.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].trace_id, "poolguard::check_bounds::0000000000000001");
        assert_eq!(records[0].ptr, Some(0x10));
        assert!(log.is_empty());
    }

    #[test]
    fn ring_discards_oldest() {
        let mut log = EventLog::with_capacity(LogLevel::Trace, 2);
        for i in 0..5 {
            log.record(Event::new(LogLevel::Info, "pool_free", "free", "ok").size(i), String::new);
        }
        assert_eq!(log.len(), 2);
        assert_eq!(log.dropped(), 3);
        let sizes: Vec<_> = log.drain().into_iter().map(|r| r.size).collect();
        assert_eq!(sizes, vec![Some(3), Some(4)]);
    }

    #[test]
    fn records_serialize_as_json() {
        let mut log = EventLog::new(LogLevel::Trace);
        log.record(
            Event::new(LogLevel::Debug, "pool_init", "init", "ok").pool(Some(3)),
            || "node_size=16".to_string(),
        );
        let rec = log.drain().pop().unwrap();
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["level"], "debug");
        assert_eq!(json["pool"], 3);
        assert!(json.get("ptr").is_none());
        assert_eq!(LogLevel::from_str_loose("WARNING"), LogLevel::Warn);
    }
}
