/// Temporary ids and timestamps for optimistic messages
use crate::types::MessageId;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Hands out strictly decreasing negative ids: -1, -2, -3, ...
///
/// Shared by every timeline of a client so a temporary id never repeats within
/// the process, even across reopened conversations.
#[derive(Debug, Clone, Default)]
pub struct TempIdGenerator {
    counter: Arc<AtomicI64>,
}

impl TempIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> MessageId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        MessageId(-n)
    }
}

/// Source of timestamps for optimistic entries.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that always returns the same instant, for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
