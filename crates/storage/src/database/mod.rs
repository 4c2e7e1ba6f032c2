//! Typed collections on top of a raw [`Storage`] backend.
//!
//! Every read-modify-write goes through [`Database::upsert`], which maps to a
//! single atomic backend update, so concurrent writers on the same record never
//! lose increments. Normalize sweeps only write a record back when it is still
//! byte-identical to the snapshot they inspected; a record that changed in
//! between is left for the next sweep.

mod approval;
mod banlist;
mod behavior;
mod cache;
mod data;
mod servers;

pub use approval::ApprovalUse;
pub use behavior::{CandidateOptions, FailPolicy, FailStep, FailSweep};
pub use servers::ServerSweep;

use crate::{Collection, MemoryStorage, PruneReport, Result, Storage, StorageError};
use arbor_types::{
    ApprovalRecord, BanlistEntry, BehaviorCandidate, BehaviorDelay, BehaviorFail, CacheRecord,
    DataRecord, ServerRecord,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

const KEY_SEPARATOR: &str = "\u{1f}";

/// Join key parts into a composite record key.
pub fn record_key(parts: &[&str]) -> String {
    parts.join(KEY_SEPARATOR)
}

/// Prefix matching every composite key whose first part is `part`.
pub(crate) fn key_prefix(part: &str) -> String {
    format!("{part}{KEY_SEPARATOR}")
}

/// A record stored in one collection under a derived key.
pub trait Document: Serialize + DeserializeOwned {
    const COLLECTION: Collection;

    fn key(&self) -> String;
}

impl Document for ServerRecord {
    const COLLECTION: Collection = Collection::Servers;

    fn key(&self) -> String {
        self.address.clone()
    }
}

impl Document for BanlistEntry {
    const COLLECTION: Collection = Collection::Banlist;

    fn key(&self) -> String {
        self.address.clone()
    }
}

impl Document for BehaviorCandidate {
    const COLLECTION: Collection = Collection::BehaviorCandidates;

    fn key(&self) -> String {
        record_key(&[&self.action, &self.address])
    }
}

impl Document for BehaviorFail {
    const COLLECTION: Collection = Collection::BehaviorFails;

    fn key(&self) -> String {
        record_key(&[&self.action, &self.address])
    }
}

impl Document for BehaviorDelay {
    const COLLECTION: Collection = Collection::BehaviorDelays;

    fn key(&self) -> String {
        record_key(&[&self.action, &self.address])
    }
}

impl Document for ApprovalRecord {
    const COLLECTION: Collection = Collection::Approval;

    fn key(&self) -> String {
        record_key(&[&self.action, &self.client_ip.to_string()])
    }
}

impl Document for CacheRecord {
    const COLLECTION: Collection = Collection::Cache;

    fn key(&self) -> String {
        record_key(&[&self.cache_type, &self.key])
    }
}

impl Document for DataRecord {
    const COLLECTION: Collection = Collection::Data;

    fn key(&self) -> String {
        self.name.clone()
    }
}

/// What a sweep decided for one record.
pub(crate) enum SweepAction<D> {
    Keep,
    Update(D),
    Remove,
}

#[derive(Clone)]
pub struct Database {
    storage: Arc<dyn Storage>,
}

impl Database {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Ephemeral database backed by [`MemoryStorage`].
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStorage::default()))
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn init(&self) -> Result<()> {
        self.storage.init()
    }

    pub fn deinit(&self) -> Result<()> {
        self.storage.deinit()
    }

    pub fn destroy(&self) -> Result<()> {
        self.storage.destroy()
    }

    pub fn generate_id(&self) -> Result<u64> {
        self.storage.generate_id()
    }

    pub fn find_one<D: Document>(&self, key: &str) -> Result<Option<D>> {
        self.storage
            .get(D::COLLECTION, key)?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .map_err(StorageError::from)
    }

    /// Every decodable record under `prefix` accepted by `filter`.
    pub fn find<D: Document>(&self, prefix: &str, filter: impl Fn(&D) -> bool) -> Result<Vec<D>> {
        let mut found = Vec::new();
        for (key, bytes) in self.storage.scan_prefix(D::COLLECTION, prefix)? {
            match serde_json::from_slice::<D>(&bytes) {
                Ok(doc) if filter(&doc) => found.push(doc),
                Ok(_) => {}
                Err(err) => warn!(
                    "Skipping undecodable {} record {:?}: {}",
                    D::COLLECTION.name(),
                    key,
                    err
                ),
            }
        }
        Ok(found)
    }

    pub fn count<D: Document>(&self, prefix: &str, filter: impl Fn(&D) -> bool) -> Result<usize> {
        Ok(self.find(prefix, filter)?.len())
    }

    /// Insert or overwrite a record.
    pub fn insert<D: Document>(&self, doc: &D) -> Result<()> {
        self.storage
            .insert(D::COLLECTION, &doc.key(), serde_json::to_vec(doc)?)
    }

    /// Atomically merge into the record at `key`. Returning `None` from `merge`
    /// deletes the record.
    pub fn upsert<D: Document>(
        &self,
        key: &str,
        mut merge: impl FnMut(Option<D>) -> Option<D>,
    ) -> Result<Option<D>> {
        let mut failure: Option<StorageError> = None;
        let stored = self.storage.update(D::COLLECTION, key, &mut |raw| {
            failure = None;
            let current = match raw.map(serde_json::from_slice::<D>).transpose() {
                Ok(current) => current,
                Err(err) => {
                    failure = Some(err.into());
                    return raw.map(<[u8]>::to_vec);
                }
            };
            match merge(current).map(|doc| serde_json::to_vec(&doc)).transpose() {
                Ok(bytes) => bytes,
                Err(err) => {
                    failure = Some(err.into());
                    raw.map(<[u8]>::to_vec)
                }
            }
        })?;

        if let Some(err) = failure {
            return Err(err);
        }
        stored
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .map_err(StorageError::from)
    }

    pub fn remove<D: Document>(&self, key: &str) -> Result<Option<D>> {
        Ok(self
            .storage
            .remove(D::COLLECTION, key)?
            .and_then(|bytes| serde_json::from_slice(&bytes).ok()))
    }

    /// Delete every record under `prefix` accepted by `filter`.
    pub fn remove_where<D: Document>(
        &self,
        prefix: &str,
        filter: impl Fn(&D) -> bool,
    ) -> Result<usize> {
        let mut removed = 0;
        for doc in self.find(prefix, filter)? {
            if self.storage.remove(D::COLLECTION, &doc.key())?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Visit every record under `prefix`, applying the decided action only if
    /// the record is unchanged since it was read. Individual failures are
    /// logged and counted, never propagated.
    pub(crate) fn sweep<D: Document>(
        &self,
        prefix: &str,
        report: &mut PruneReport,
        mut visit: impl FnMut(D) -> SweepAction<D>,
    ) -> Result<()> {
        for (key, bytes) in self.storage.scan_prefix(D::COLLECTION, prefix)? {
            let doc = match serde_json::from_slice::<D>(&bytes) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(
                        "Normalize skipped undecodable {} record {:?}: {}",
                        D::COLLECTION.name(),
                        key,
                        err
                    );
                    report.failed_entries += 1;
                    continue;
                }
            };

            let replacement = match visit(doc) {
                SweepAction::Keep => {
                    report.retained_entries += 1;
                    continue;
                }
                SweepAction::Update(doc) => match serde_json::to_vec(&doc) {
                    Ok(bytes) => Some(bytes),
                    Err(err) => {
                        warn!("Normalize could not encode {:?}: {}", key, err);
                        report.failed_entries += 1;
                        continue;
                    }
                },
                SweepAction::Remove => None,
            };

            let removing = replacement.is_none();
            match self.replace_if_unchanged(D::COLLECTION, &key, &bytes, replacement) {
                Ok(true) if removing => report.pruned_entries += 1,
                Ok(true) => {
                    report.updated_entries += 1;
                    report.retained_entries += 1;
                }
                Ok(false) => report.retained_entries += 1,
                Err(err) => {
                    warn!(
                        "Normalize failed on {} record {:?}: {}",
                        D::COLLECTION.name(),
                        key,
                        err
                    );
                    report.failed_entries += 1;
                }
            }
        }
        Ok(())
    }

    /// Compare-and-swap on raw bytes. Returns whether the swap happened.
    fn replace_if_unchanged(
        &self,
        collection: Collection,
        key: &str,
        expected: &[u8],
        replacement: Option<Vec<u8>>,
    ) -> Result<bool> {
        let mut swapped = false;
        self.storage.update(collection, key, &mut |current| {
            if current == Some(expected) {
                swapped = true;
                replacement.clone()
            } else {
                swapped = false;
                current.map(<[u8]>::to_vec)
            }
        })?;
        Ok(swapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::DataRecord;
    use serde_json::json;

    #[test]
    fn upsert_merges_and_deletes() {
        let db = Database::memory();
        let key = "counter";
        for _ in 0..3 {
            db.upsert::<DataRecord>(key, |current| {
                let value = current.map(|r| r.value.as_u64().unwrap_or(0)).unwrap_or(0);
                Some(DataRecord {
                    name: key.to_string(),
                    value: json!(value + 1),
                })
            })
            .unwrap();
        }
        let stored: DataRecord = db.find_one(key).unwrap().unwrap();
        assert_eq!(stored.value, json!(3));

        let removed = db.upsert::<DataRecord>(key, |_| None).unwrap();
        assert!(removed.is_none());
        assert!(db.find_one::<DataRecord>(key).unwrap().is_none());
    }

    #[test]
    fn upsert_reports_corrupt_records_without_touching_them() {
        let db = Database::memory();
        db.storage()
            .insert(Collection::Data, "bad", b"not json".to_vec())
            .unwrap();
        let result = db.upsert::<DataRecord>("bad", |_| None);
        assert!(matches!(result, Err(StorageError::Serialization(_))));
        assert!(db.storage().get(Collection::Data, "bad").unwrap().is_some());
    }

    #[test]
    fn sweep_counts_and_skips_corrupt_records() {
        let db = Database::memory();
        for name in ["a", "b", "c"] {
            db.insert(&DataRecord {
                name: name.to_string(),
                value: json!(name),
            })
            .unwrap();
        }
        db.storage()
            .insert(Collection::Data, "z", b"{".to_vec())
            .unwrap();

        let mut report = PruneReport::new(Collection::Data);
        db.sweep::<DataRecord>("", &mut report, |record| match record.name.as_str() {
            "a" => SweepAction::Remove,
            "b" => SweepAction::Update(DataRecord {
                value: json!("updated"),
                ..record
            }),
            _ => SweepAction::Keep,
        })
        .unwrap();

        assert_eq!(report.pruned_entries, 1);
        assert_eq!(report.updated_entries, 1);
        assert_eq!(report.retained_entries, 2);
        assert_eq!(report.failed_entries, 1);
        let b: DataRecord = db.find_one("b").unwrap().unwrap();
        assert_eq!(b.value, json!("updated"));
    }

    #[test]
    fn composite_keys_scope_prefix_scans() {
        assert_eq!(key_prefix("reg"), format!("reg{}", KEY_SEPARATOR));
        assert!(record_key(&["register", "a:1"]).starts_with(&key_prefix("register")));
        assert!(!record_key(&["registered", "a:1"]).starts_with(&key_prefix("register")));
    }
}
