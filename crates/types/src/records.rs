//! Persistent records owned by the storage engine.

use crate::time_service::Timestamp;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Where a master record was learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterOrigin {
    /// Received in the structure answered by our backlink.
    #[default]
    Upstream,
    /// Reported by one of our slaves about its own subtree.
    Downstream,
}

/// One record per known peer. A record may hold several roles at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub address: String,
    pub ip: Option<IpAddr>,
    pub is_master: bool,
    pub is_slave: bool,
    pub is_backlink: bool,
    /// Declared slave count of a master.
    pub size: u64,
    /// Load-balancing weight of a slave, 0 to 100.
    pub availability: f64,
    /// Ancestors of this peer, nearest first.
    pub chain: Vec<String>,
    pub fails: u64,
    pub is_broken: bool,
    pub master_origin: MasterOrigin,
    /// Monotonic id handed out when the slave role was granted.
    pub registration: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ServerRecord {
    pub fn new(address: impl Into<String>, now: Timestamp) -> Self {
        let address = address.into();
        Self {
            ip: crate::address_ip(&address),
            address,
            is_master: false,
            is_slave: false,
            is_backlink: false,
            size: 0,
            availability: 0.0,
            chain: Vec::new(),
            fails: 0,
            is_broken: false,
            master_origin: MasterOrigin::Upstream,
            registration: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_role(&self) -> bool {
        self.is_master || self.is_slave || self.is_backlink
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanlistEntry {
    pub address: String,
    pub ip: Option<IpAddr>,
    /// The ban is lifted at this time.
    pub resolved_at: Timestamp,
    pub created_at: Timestamp,
}

impl BanlistEntry {
    pub fn is_active(&self, now: Timestamp) -> bool {
        self.resolved_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorCandidate {
    pub action: String,
    pub address: String,
    pub suspicion: f64,
    pub excuse: f64,
    pub seq: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorFail {
    pub action: String,
    pub address: String,
    pub suspicion: f64,
    /// Net fail count.
    pub balance: i64,
    pub up: u64,
    pub down: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorDelay {
    pub action: String,
    pub address: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub action: String,
    pub client_ip: IpAddr,
    pub key: String,
    /// Request time bucketed to the action period.
    pub started_at: Timestamp,
    pub info: String,
    pub answer: String,
    pub used_by: Vec<String>,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub cache_type: String,
    pub key: String,
    pub value: serde_json::Value,
    pub seq: u64,
    pub created_at: Timestamp,
    pub accessed_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub name: String,
    pub value: serde_json::Value,
}
