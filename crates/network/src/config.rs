use arbor_security::{ApprovalConfig, BehaviorConfig};
use arbor_storage::{CacheOptions, FailPolicy};
use arbor_types::{create_address, duration_serde, option_duration_serde, SizeValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

/// Credentials required by `/status` and sent along with node-to-node calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    /// Fallback addresses asked for registration candidates.
    pub initial_addresses: Vec<String>,
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    /// Consecutive failures after which a peer counts as broken.
    pub server_max_fails: u64,
    #[serde(with = "duration_serde")]
    pub sync_interval: Duration,
    /// Defaults to three sync intervals.
    #[serde(with = "option_duration_serde")]
    pub slave_lifetime: Option<Duration>,
    /// Defaults to three sync intervals.
    #[serde(with = "option_duration_serde")]
    pub master_lifetime: Option<Duration>,
    pub slaves_limit: SizeValue,
    pub candidates_limit: SizeValue,
    pub candidate_suspicion_level: SizeValue,
    pub candidate_excuse_step: f64,
    /// Proxies allowed to set `x-forwarded-for`.
    pub trusted_proxies: Vec<IpAddr>,
    pub auth: Option<AuthConfig>,
    #[serde(with = "duration_serde")]
    pub ban_lifetime: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
            initial_addresses: Vec::new(),
            request_timeout: Duration::from_secs(10),
            server_max_fails: 10,
            sync_interval: Duration::from_secs(30),
            slave_lifetime: None,
            master_lifetime: None,
            slaves_limit: SizeValue::Auto,
            candidates_limit: SizeValue::Auto,
            candidate_suspicion_level: SizeValue::Auto,
            candidate_excuse_step: 1.0,
            trusted_proxies: Vec::new(),
            auth: None,
            ban_lifetime: Duration::from_secs(18 * 60),
        }
    }
}

impl NetworkConfig {
    /// The address other nodes reach this one at.
    pub fn address(&self) -> String {
        create_address(&self.host, self.port)
    }

    pub fn slave_lifetime(&self) -> Duration {
        self.slave_lifetime.unwrap_or(self.sync_interval * 3)
    }

    pub fn master_lifetime(&self) -> Duration {
        self.master_lifetime.unwrap_or(self.sync_interval * 3)
    }
}

/// Everything a [`crate::Node`] needs besides its storage and transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    /// Approval-protected actions.
    pub approval: HashMap<String, ApprovalConfig>,
    /// Fail policies by action.
    pub behavior: HashMap<String, FailPolicy>,
    /// Named database caches.
    pub cache: HashMap<String, CacheOptions>,
}

impl NodeConfig {
    pub fn behavior_config(&self) -> BehaviorConfig {
        BehaviorConfig {
            candidates_limit: self.network.candidates_limit.clone(),
            candidate_suspicion_level: self.network.candidate_suspicion_level.clone(),
            candidate_excuse_step: self.network.candidate_excuse_step,
            candidate_lifetime: self.network.slave_lifetime(),
            fails: self.behavior.clone(),
        }
    }
}
