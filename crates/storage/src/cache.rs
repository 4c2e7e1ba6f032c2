//! Named caches living in the database cache collection.

use crate::{Database, PruneReport, Result, RetentionPolicy};
use arbor_types::duration_serde;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    pub limit: usize,
    #[serde(with = "duration_serde")]
    pub lifetime: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            limit: 50_000,
            lifetime: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl CacheOptions {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy::new(Some(self.limit), Some(self.lifetime))
    }
}

/// A cache partition identified by name.
#[derive(Clone)]
pub struct DatabaseCache {
    name: String,
    db: Database,
    options: CacheOptions,
}

impl DatabaseCache {
    pub fn new(name: impl Into<String>, db: Database, options: CacheOptions) -> Self {
        Self {
            name: name.into(),
            db,
            options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Typed read. A value that no longer decodes is evicted and reported as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(record) = self.db.get_cache(&self.name, key)? else {
            return Ok(None);
        };
        match serde_json::from_value(record.value) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!("Evicting undecodable {} cache entry {}: {}", self.name, key, err);
                self.remove(key)?;
                Ok(None)
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.db.set_cache(
            &self.name,
            key,
            serde_json::to_value(value)?,
            Some(self.options.limit),
        )?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.db.remove_cache(&self.name, key)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<usize> {
        self.db.flush_cache(&self.name)
    }

    pub fn normalize(&self) -> Result<PruneReport> {
        self.db.normalize_cache(&self.name, &self.options.policy())
    }
}
