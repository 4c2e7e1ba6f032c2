use super::{key_prefix, record_key, Database, SweepAction};
use crate::{Collection, PruneReport, Result, RetentionPolicy};
use arbor_types::{now_ms, CacheRecord};
use tracing::debug;

impl Database {
    /// Store `value` under `(cache_type, key)`. Overwriting keeps the original
    /// insertion order. With a limit, the oldest insertions are evicted.
    pub fn set_cache(
        &self,
        cache_type: &str,
        key: &str,
        value: serde_json::Value,
        limit: Option<usize>,
    ) -> Result<CacheRecord> {
        let now = now_ms();
        let seq = self.generate_id()?;
        let record = self
            .upsert::<CacheRecord>(&record_key(&[cache_type, key]), |current| {
                Some(match current {
                    Some(mut record) => {
                        record.value = value.clone();
                        record
                    }
                    None => CacheRecord {
                        cache_type: cache_type.to_string(),
                        key: key.to_string(),
                        value: value.clone(),
                        seq,
                        created_at: now,
                        accessed_at: now,
                    },
                })
            })?
            .ok_or(crate::StorageError::NotInitialized)?;

        if limit.is_some() {
            self.normalize_cache(cache_type, &RetentionPolicy::new(limit, None))?;
        }
        Ok(record)
    }

    /// Read a cached value and touch `accessed_at`.
    pub fn get_cache(&self, cache_type: &str, key: &str) -> Result<Option<CacheRecord>> {
        let now = now_ms();
        self.upsert::<CacheRecord>(&record_key(&[cache_type, key]), |current| {
            current.map(|mut record| {
                record.accessed_at = now;
                record
            })
        })
    }

    pub fn remove_cache(&self, cache_type: &str, key: &str) -> Result<Option<CacheRecord>> {
        self.remove(&record_key(&[cache_type, key]))
    }

    pub fn flush_cache(&self, cache_type: &str) -> Result<usize> {
        self.remove_where(&key_prefix(cache_type), |_: &CacheRecord| true)
    }

    /// Apply TTL from `created_at` and the capacity limit, oldest insertion first.
    pub fn normalize_cache(&self, cache_type: &str, policy: &RetentionPolicy) -> Result<PruneReport> {
        let now = now_ms();
        let prefix = key_prefix(cache_type);
        let mut report = PruneReport::new(Collection::Cache);
        if policy.is_disabled() {
            return Ok(report);
        }

        self.sweep::<CacheRecord>(&prefix, &mut report, |record| {
            if policy.is_expired(record.created_at, now) {
                SweepAction::Remove
            } else {
                SweepAction::Keep
            }
        })?;

        let mut records = self.find(&prefix, |_: &CacheRecord| true)?;
        let excess = policy.excess(records.len());
        if excess > 0 {
            records.sort_by_key(|record| record.seq);
            for record in records.into_iter().take(excess) {
                if self
                    .remove::<CacheRecord>(&record_key(&[cache_type, &record.key]))?
                    .is_some()
                {
                    report.pruned_entries += 1;
                    report.retained_entries = report.retained_entries.saturating_sub(1);
                }
            }
            debug!("Evicted {} {} cache entries over limit", excess, cache_type);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn limit_evicts_oldest_insertions_regardless_of_reads() {
        let db = Database::memory();
        let limit = Some(3);
        for i in 0..3 {
            db.set_cache("test", &format!("k{i}"), json!(i), limit).unwrap();
        }
        // reading the oldest entry does not protect it
        let read = db.get_cache("test", "k0").unwrap().unwrap();
        assert!(read.accessed_at >= read.created_at);
        db.set_cache("test", "k3", json!(3), limit).unwrap();

        assert!(db.get_cache("test", "k0").unwrap().is_none());
        for key in ["k1", "k2", "k3"] {
            assert!(db.get_cache("test", key).unwrap().is_some());
        }
    }

    #[test]
    fn overwrite_keeps_insertion_order() {
        let db = Database::memory();
        db.set_cache("test", "a", json!(1), Some(2)).unwrap();
        db.set_cache("test", "b", json!(2), Some(2)).unwrap();
        db.set_cache("test", "a", json!(10), Some(2)).unwrap();
        db.set_cache("test", "c", json!(3), Some(2)).unwrap();

        assert!(db.get_cache("test", "a").unwrap().is_none());
        assert_eq!(db.get_cache("test", "c").unwrap().unwrap().value, json!(3));
    }

    #[test]
    fn types_are_partitioned() {
        let db = Database::memory();
        db.set_cache("one", "k", json!(1), Some(1)).unwrap();
        db.set_cache("two", "k", json!(2), Some(1)).unwrap();
        assert_eq!(db.get_cache("one", "k").unwrap().unwrap().value, json!(1));
        assert_eq!(db.flush_cache("one").unwrap(), 1);
        assert!(db.get_cache("two", "k").unwrap().is_some());
        assert!(db.remove_cache("two", "k").unwrap().is_some());
        assert!(db.get_cache("two", "k").unwrap().is_none());
    }

    #[test]
    fn ttl_counts_from_creation() {
        let db = Database::memory();
        db.set_cache("test", "old", json!(1), None).unwrap();
        db.set_cache("test", "new", json!(2), None).unwrap();
        db.upsert::<CacheRecord>(&record_key(&["test", "old"]), |record| {
            record.map(|mut r| {
                r.created_at = 0;
                r.accessed_at = now_ms();
                r
            })
        })
        .unwrap();

        let report = db
            .normalize_cache("test", &RetentionPolicy::new(None, Some(Duration::from_secs(60))))
            .unwrap();
        assert_eq!(report.pruned_entries, 1);
        assert!(db.get_cache("test", "old").unwrap().is_none());
        assert!(db.get_cache("test", "new").unwrap().is_some());
    }
}
