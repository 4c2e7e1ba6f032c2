use crate::Collection;
use arbor_types::Timestamp;
use std::time::Duration;

/// Retention policy describing how much of a collection partition to keep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Maximum number of records to keep. `None` disables capacity based retention.
    pub limit: Option<usize>,
    /// Age after which a record is dropped. `None` disables time based retention.
    pub lifetime: Option<Duration>,
}

impl RetentionPolicy {
    pub fn new(limit: Option<usize>, lifetime: Option<Duration>) -> Self {
        Self { limit, lifetime }
    }

    /// Whether a record stamped at `timestamp` has outlived the policy.
    pub fn is_expired(&self, timestamp: Timestamp, now: Timestamp) -> bool {
        self.lifetime
            .map(|lifetime| timestamp.saturating_add(lifetime.as_millis() as u64) < now)
            .unwrap_or(false)
    }

    /// How many of `count` records exceed the capacity limit.
    pub fn excess(&self, count: usize) -> usize {
        self.limit
            .map(|limit| count.saturating_sub(limit))
            .unwrap_or(0)
    }

    /// Check if the policy is entirely disabled.
    pub fn is_disabled(&self) -> bool {
        self.limit.is_none() && self.lifetime.is_none()
    }
}

/// Whether a record stamped at `timestamp` is older than `lifetime`.
pub fn is_older_than(timestamp: Timestamp, lifetime: Duration, now: Timestamp) -> bool {
    RetentionPolicy::new(None, Some(lifetime)).is_expired(timestamp, now)
}

/// Outcome of one normalize pass over a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub target: Collection,
    pub pruned_entries: u64,
    pub updated_entries: u64,
    pub retained_entries: u64,
    /// Records skipped because they could not be decoded or written.
    pub failed_entries: u64,
}

impl PruneReport {
    pub fn new(target: Collection) -> Self {
        Self {
            target,
            pruned_entries: 0,
            updated_entries: 0,
            retained_entries: 0,
            failed_entries: 0,
        }
    }
}
