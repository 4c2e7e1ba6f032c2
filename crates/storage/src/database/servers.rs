use super::{Database, SweepAction};
use crate::retention::is_older_than;
use crate::{Collection, PruneReport, Result};
use arbor_types::{now_ms, MasterOrigin, ServerRecord};
use std::cmp::Ordering;
use std::time::Duration;
use tracing::{debug, info};

/// Parameters of the servers consistency sweep.
#[derive(Debug, Clone)]
pub struct ServerSweep {
    pub own_address: String,
    pub max_fails: u64,
    /// Slaves that have not reported in this long lose the slave role.
    pub slave_lifetime: Option<Duration>,
    /// Masters not refreshed in this long lose the master role.
    pub master_lifetime: Option<Duration>,
}

fn weakest_first(a: &ServerRecord, b: &ServerRecord) -> Ordering {
    a.availability
        .partial_cmp(&b.availability)
        .unwrap_or(Ordering::Equal)
        .then(a.registration.cmp(&b.registration))
}

impl Database {
    pub fn get_server(&self, address: &str) -> Result<Option<ServerRecord>> {
        self.find_one(address)
    }

    pub fn get_servers(&self) -> Result<Vec<ServerRecord>> {
        self.find("", |_: &ServerRecord| true)
    }

    /// Merge a role into the record for `address`, creating it if needed.
    fn update_server(
        &self,
        address: &str,
        mut apply: impl FnMut(&mut ServerRecord),
    ) -> Result<Option<ServerRecord>> {
        let now = now_ms();
        self.upsert::<ServerRecord>(address, |current| {
            let mut record = current.unwrap_or_else(|| ServerRecord::new(address, now));
            apply(&mut record);
            record.updated_at = now;
            record.has_role().then_some(record)
        })
    }

    /// Strip a role from an existing record, deleting it once no role is left.
    fn strip_role(
        &self,
        address: &str,
        mut strip: impl FnMut(&mut ServerRecord) -> bool,
    ) -> Result<bool> {
        let mut stripped = false;
        self.upsert::<ServerRecord>(address, |current| {
            let mut record = current?;
            stripped = strip(&mut record);
            record.has_role().then_some(record)
        })?;
        Ok(stripped)
    }

    /// Add or refresh a slave. With a capacity, the weakest other slaves are
    /// evicted until the count fits.
    pub fn add_slave(
        &self,
        address: &str,
        availability: f64,
        capacity: Option<u64>,
    ) -> Result<ServerRecord> {
        let registration = self.generate_id()?;
        let record = self
            .update_server(address, |record| {
                if !record.is_slave {
                    record.is_slave = true;
                    record.registration = registration;
                }
                record.availability = availability.clamp(0.0, 100.0);
            })?
            .ok_or(crate::StorageError::NotInitialized)?;

        if let Some(capacity) = capacity {
            let mut others: Vec<ServerRecord> = self
                .get_slaves()?
                .into_iter()
                .filter(|slave| slave.address != address)
                .collect();
            let excess = (others.len() as u64 + 1).saturating_sub(capacity) as usize;
            if excess > 0 {
                others.sort_by(weakest_first);
                for slave in others.into_iter().take(excess) {
                    info!("Evicting slave {} to make room for {}", slave.address, address);
                    self.remove_slave(&slave.address)?;
                }
            }
        }
        Ok(record)
    }

    /// Slaves in registration order, oldest first.
    pub fn get_slaves(&self) -> Result<Vec<ServerRecord>> {
        let mut slaves = self.find("", |record: &ServerRecord| record.is_slave)?;
        slaves.sort_by_key(|slave| slave.registration);
        Ok(slaves)
    }

    pub fn get_slave(&self, address: &str) -> Result<Option<ServerRecord>> {
        Ok(self.get_server(address)?.filter(|record| record.is_slave))
    }

    pub fn has_slave(&self, address: &str) -> Result<bool> {
        Ok(self.get_slave(address)?.is_some())
    }

    pub fn get_slaves_count(&self) -> Result<u64> {
        Ok(self.count("", |record: &ServerRecord| record.is_slave)? as u64)
    }

    /// A node with at least one slave is a master.
    pub fn is_master(&self) -> Result<bool> {
        Ok(self.get_slaves_count()? > 0)
    }

    pub fn remove_slave(&self, address: &str) -> Result<bool> {
        self.strip_role(address, |record| std::mem::replace(&mut record.is_slave, false))
    }

    pub fn remove_slaves(&self) -> Result<usize> {
        let mut removed = 0;
        for slave in self.get_slaves()? {
            if self.remove_slave(&slave.address)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Drop the `limit` oldest-registered slaves.
    pub fn shift_slaves(&self, limit: usize) -> Result<Vec<ServerRecord>> {
        let mut shifted = Vec::new();
        for slave in self.get_slaves()?.into_iter().take(limit) {
            if self.remove_slave(&slave.address)? {
                shifted.push(slave);
            }
        }
        if !shifted.is_empty() {
            debug!("Shifted {} slaves", shifted.len());
        }
        Ok(shifted)
    }

    /// Make `address` the only backlink.
    pub fn add_backlink(&self, address: &str, chain: Vec<String>) -> Result<ServerRecord> {
        if let Some(previous) = self.get_backlink()? {
            if previous.address != address {
                self.remove_backlink()?;
            }
        }
        self.update_server(address, |record| {
            record.is_backlink = true;
            record.chain = chain.clone();
        })?
        .ok_or(crate::StorageError::NotInitialized)
    }

    pub fn get_backlink(&self) -> Result<Option<ServerRecord>> {
        Ok(self
            .find("", |record: &ServerRecord| record.is_backlink)?
            .into_iter()
            .next())
    }

    /// Refresh the chain of the current backlink.
    pub fn update_backlink_chain(&self, address: &str, chain: Vec<String>) -> Result<bool> {
        let mut updated = false;
        self.upsert::<ServerRecord>(address, |current| {
            let mut record = current?;
            if record.is_backlink {
                record.chain = chain.clone();
                record.updated_at = now_ms();
                updated = true;
            }
            Some(record)
        })?;
        Ok(updated)
    }

    pub fn remove_backlink(&self) -> Result<Option<ServerRecord>> {
        let Some(backlink) = self.get_backlink()? else {
            return Ok(None);
        };
        self.strip_role(&backlink.address, |record| {
            record.chain.clear();
            std::mem::replace(&mut record.is_backlink, false)
        })?;
        Ok(Some(backlink))
    }

    pub fn add_master(
        &self,
        address: &str,
        size: u64,
        origin: MasterOrigin,
    ) -> Result<ServerRecord> {
        self.update_server(address, |record| {
            record.is_master = true;
            record.size = size;
            record.master_origin = origin;
        })?
        .ok_or(crate::StorageError::NotInitialized)
    }

    pub fn get_master(&self, address: &str) -> Result<Option<ServerRecord>> {
        Ok(self.get_server(address)?.filter(|record| record.is_master))
    }

    pub fn get_masters(&self) -> Result<Vec<ServerRecord>> {
        self.find("", |record: &ServerRecord| record.is_master)
    }

    pub fn get_masters_count(&self) -> Result<u64> {
        Ok(self.count("", |record: &ServerRecord| record.is_master)? as u64)
    }

    pub fn remove_master(&self, address: &str) -> Result<bool> {
        self.strip_role(address, |record| {
            record.size = 0;
            std::mem::replace(&mut record.is_master, false)
        })
    }

    /// Remove every master, or only those learned from `origin`.
    pub fn remove_masters(&self, origin: Option<MasterOrigin>) -> Result<usize> {
        let mut removed = 0;
        for master in self.get_masters()? {
            if origin.map_or(true, |origin| master.master_origin == origin)
                && self.remove_master(&master.address)?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Count a failed request. Unknown addresses are ignored.
    pub fn failed_server_address(
        &self,
        address: &str,
        max_fails: u64,
    ) -> Result<Option<ServerRecord>> {
        self.upsert::<ServerRecord>(address, |current| {
            let mut record = current?;
            record.fails += 1;
            record.is_broken = record.fails > max_fails;
            Some(record)
        })
    }

    pub fn success_server_address(&self, address: &str) -> Result<Option<ServerRecord>> {
        self.upsert::<ServerRecord>(address, |current| {
            let mut record = current?;
            record.fails = 0;
            record.is_broken = false;
            Some(record)
        })
    }

    /// Consistency and TTL sweep over the servers collection.
    pub fn normalize_servers(&self, sweep: &ServerSweep) -> Result<PruneReport> {
        let now = now_ms();
        let mut report = PruneReport::new(Collection::Servers);
        self.sweep::<ServerRecord>("", &mut report, |mut record| {
            if record.address == sweep.own_address {
                return SweepAction::Remove;
            }

            let original = record.clone();
            record.is_broken = record.fails > sweep.max_fails;
            if record.is_slave
                && sweep
                    .slave_lifetime
                    .is_some_and(|lifetime| is_older_than(record.updated_at, lifetime, now))
            {
                record.is_slave = false;
            }
            if record.is_master
                && !record.is_backlink
                && sweep
                    .master_lifetime
                    .is_some_and(|lifetime| is_older_than(record.updated_at, lifetime, now))
            {
                record.is_master = false;
                record.size = 0;
            }

            if !record.has_role() {
                SweepAction::Remove
            } else if record != original {
                SweepAction::Update(record)
            } else {
                SweepAction::Keep
            }
        })?;
        Ok(report)
    }
}
