//! Reputation ledgers keyed by `(action, address)`: candidacy, fails and delays,
//! plus the banlist they feed.

use arbor_storage::{CandidateOptions, Database, FailPolicy, FailStep, PruneReport};
use arbor_types::{
    address_ip, duration_serde, normalize_ip, BanlistEntry, BehaviorCandidate, BehaviorDelay,
    BehaviorFail, NodeError, NodeResult, SizeValue,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Distinct candidates kept per action, relative to the network size.
    pub candidates_limit: SizeValue,
    /// Suspicion a candidate needs to count as validated.
    pub candidate_suspicion_level: SizeValue,
    pub candidate_excuse_step: f64,
    #[serde(with = "duration_serde")]
    pub candidate_lifetime: Duration,
    /// Fail policies by action.
    pub fails: HashMap<String, FailPolicy>,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            candidates_limit: SizeValue::Auto,
            candidate_suspicion_level: SizeValue::Auto,
            candidate_excuse_step: 1.0,
            candidate_lifetime: Duration::from_secs(30 * 60),
            fails: HashMap::new(),
        }
    }
}

pub struct BehaviorEngine {
    db: Database,
    config: BehaviorConfig,
    fail_policies: RwLock<HashMap<String, FailPolicy>>,
}

impl BehaviorEngine {
    pub fn new(db: Database, config: BehaviorConfig) -> Self {
        let fail_policies = RwLock::new(config.fails.clone());
        Self {
            db,
            config,
            fail_policies,
        }
    }

    pub fn config(&self) -> &BehaviorConfig {
        &self.config
    }

    fn candidate_options(&self, network_size: u64) -> CandidateOptions {
        CandidateOptions {
            limit: self.config.candidates_limit.resolve(network_size).max(1) as usize,
            excuse_step: self.config.candidate_excuse_step,
        }
    }

    /// Suspicion required for a validated candidate. Never below two, so a
    /// single attempt is not enough.
    pub fn candidate_suspicion_level(&self, network_size: u64) -> f64 {
        self.config
            .candidate_suspicion_level
            .resolve(network_size)
            .max(2) as f64
    }

    pub fn add_candidate(
        &self,
        action: &str,
        address: &str,
        network_size: u64,
    ) -> NodeResult<BehaviorCandidate> {
        let candidate =
            self.db
                .add_behavior_candidate(action, address, self.candidate_options(network_size))?;
        debug!(
            "Candidate {} for {} at suspicion {}",
            address, action, candidate.suspicion
        );
        Ok(candidate)
    }

    pub fn validated_candidates(
        &self,
        action: &str,
        network_size: u64,
    ) -> NodeResult<Vec<BehaviorCandidate>> {
        Ok(self
            .db
            .get_behavior_candidates(action, self.candidate_suspicion_level(network_size))?)
    }

    pub fn is_validated_candidate(
        &self,
        action: &str,
        address: &str,
        network_size: u64,
    ) -> NodeResult<bool> {
        let level = self.candidate_suspicion_level(network_size);
        Ok(self
            .db
            .get_behavior_candidate(action, address)?
            .is_some_and(|candidate| candidate.suspicion >= level))
    }

    pub fn normalize_candidates(&self, network_size: u64) -> NodeResult<PruneReport> {
        Ok(self.db.normalize_behavior_candidates(
            self.candidate_suspicion_level(network_size),
            Some(self.config.candidate_lifetime),
        )?)
    }

    /// Register the ban rules of a fail action. Fails can only be recorded
    /// for registered actions.
    pub fn register_fail(&self, action: impl Into<String>, policy: FailPolicy) {
        self.fail_policies.write().insert(action.into(), policy);
    }

    pub fn get_fail_options(&self, action: &str) -> Option<FailPolicy> {
        self.fail_policies.read().get(action).cloned()
    }

    fn require_fail_options(&self, action: &str) -> NodeResult<FailPolicy> {
        self.get_fail_options(action)
            .ok_or_else(|| NodeError::NotFound(format!("behavior fail action `{action}`")))
    }

    pub fn add_fail(
        &self,
        action: &str,
        address: &str,
        step: impl Into<FailStep>,
    ) -> NodeResult<BehaviorFail> {
        self.require_fail_options(action)?;
        Ok(self.db.add_behavior_fail(action, address, &step.into())?)
    }

    pub fn sub_fail(
        &self,
        action: &str,
        address: &str,
        step: impl Into<FailStep>,
    ) -> NodeResult<Option<BehaviorFail>> {
        self.require_fail_options(action)?;
        Ok(self.db.sub_behavior_fail(action, address, &step.into())?)
    }

    pub fn get_fail(&self, action: &str, address: &str) -> NodeResult<Option<BehaviorFail>> {
        Ok(self.db.get_behavior_fail(action, address)?)
    }

    /// Forget idle fails and ban addresses over their action's level.
    pub fn normalize_fails(&self) -> NodeResult<Vec<BanlistEntry>> {
        let policies = self.fail_policies.read().clone();
        let sweep = self
            .db
            .normalize_behavior_fails(|action| policies.get(action).cloned())?;
        if !sweep.banned.is_empty() {
            metrics::counter!("arbor_bans_total").increment(sweep.banned.len() as u64);
        }
        Ok(sweep.banned)
    }

    pub fn add_delay(&self, action: &str, address: &str) -> NodeResult<BehaviorDelay> {
        Ok(self.db.add_behavior_delay(action, address)?)
    }

    pub fn get_delay(&self, action: &str, address: &str) -> NodeResult<Option<BehaviorDelay>> {
        Ok(self.db.get_behavior_delay(action, address)?)
    }

    pub fn has_delay(&self, action: &str, address: &str) -> NodeResult<bool> {
        Ok(self.get_delay(action, address)?.is_some())
    }

    pub fn remove_delay(&self, action: &str, address: &str) -> NodeResult<()> {
        self.db.remove_behavior_delay(action, address)?;
        Ok(())
    }

    pub fn clear_delays(&self, action: &str) -> NodeResult<usize> {
        Ok(self.db.clear_behavior_delays(action)?)
    }

    /// Ban `address` and the IP behind it.
    pub async fn ban(&self, address: &str, lifetime: Duration) -> NodeResult<BanlistEntry> {
        let ip = resolve_host_ip(address).await;
        let entry = self.db.add_banlist_address(address, ip, lifetime)?;
        info!("Banned {} until {}", address, entry.resolved_at);
        metrics::counter!("arbor_bans_total").increment(1);
        Ok(entry)
    }

    pub fn unban(&self, address: &str) -> NodeResult<()> {
        self.db.remove_banlist_address(address)?;
        Ok(())
    }

    pub fn is_banned_address(&self, address: &str) -> NodeResult<bool> {
        if self.db.get_banlist_address(address)?.is_some() {
            return Ok(true);
        }
        match address_ip(address) {
            Some(ip) => self.is_banned_ip(ip),
            None => Ok(false),
        }
    }

    pub fn is_banned_ip(&self, ip: IpAddr) -> NodeResult<bool> {
        Ok(self.db.check_banlist_ip(ip)?)
    }

    /// Refuse requests from a banned origin.
    pub fn check_origin(&self, ip: IpAddr) -> NodeResult<()> {
        if self.is_banned_ip(ip)? {
            return Err(NodeError::Banned(normalize_ip(ip).to_string()));
        }
        Ok(())
    }

    pub fn banlist(&self) -> NodeResult<Vec<BanlistEntry>> {
        Ok(self.db.get_banlist()?)
    }

    pub fn normalize_banlist(&self) -> NodeResult<PruneReport> {
        Ok(self.db.normalize_banlist()?)
    }
}

/// The IP behind an address, resolving host names through DNS.
pub async fn resolve_host_ip(address: &str) -> Option<IpAddr> {
    if let Some(ip) = address_ip(address) {
        return Some(ip);
    }
    match tokio::net::lookup_host(address).await {
        Ok(mut addrs) => addrs.next().map(|addr| normalize_ip(addr.ip())),
        Err(err) => {
            debug!("Could not resolve {}: {}", address, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> BehaviorEngine {
        BehaviorEngine::new(Database::memory(), BehaviorConfig::default())
    }

    #[test]
    fn fails_need_a_registered_action() {
        let engine = engine();
        let err = engine.add_fail("unknown", "localhost:1", 1.0).unwrap_err();
        assert_eq!(err.kind(), arbor_types::ErrorKind::NotFound);

        engine.register_fail("test", FailPolicy::default());
        assert_eq!(engine.get_fail_options("test"), Some(FailPolicy::default()));
        let record = engine.add_fail("test", "localhost:1", 2.0).unwrap();
        assert_eq!(record.suspicion, 2.0);
        let record = engine
            .add_fail("test", "localhost:1", FailStep::computed(|b| b.balance as f64))
            .unwrap();
        assert_eq!(record.suspicion, 3.0);
        assert!(engine.sub_fail("test", "localhost:1", 3.0).unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_sweep_bans_and_origin_is_refused() {
        let engine = engine();
        engine.register_fail(
            "test",
            FailPolicy {
                fail_suspicion_level: 1.0,
                ..FailPolicy::default()
            },
        );
        engine.add_fail("test", "127.0.0.5:80", 2.0).unwrap();
        let banned = engine.normalize_fails().unwrap();
        assert_eq!(banned.len(), 1);

        let ip: IpAddr = "127.0.0.5".parse().unwrap();
        let err = engine.check_origin(ip).unwrap_err();
        assert!(matches!(err, NodeError::Banned(_)));
        assert!(engine.is_banned_address("127.0.0.5:9999").unwrap());
        assert!(engine.check_origin("127.0.0.6".parse().unwrap()).is_ok());

        engine.unban("127.0.0.5:80").unwrap();
        assert!(engine.check_origin(ip).is_ok());
    }

    #[tokio::test]
    async fn manual_ban_resolves_localhost() {
        let engine = engine();
        let entry = engine
            .ban("localhost:4000", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(entry.ip, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(engine.banlist().unwrap().len(), 1);
    }

    #[test]
    fn candidate_level_scales_with_network() {
        let engine = engine();
        assert_eq!(engine.candidate_suspicion_level(1), 2.0);
        assert_eq!(engine.candidate_suspicion_level(16), 4.0);

        engine.add_candidate("register", "localhost:1", 16).unwrap();
        assert!(!engine
            .is_validated_candidate("register", "localhost:1", 16)
            .unwrap());
        for _ in 0..3 {
            engine.add_candidate("register", "localhost:1", 16).unwrap();
        }
        assert!(engine
            .is_validated_candidate("register", "localhost:1", 16)
            .unwrap());
        assert_eq!(engine.validated_candidates("register", 16).unwrap().len(), 1);
    }

    #[test]
    fn delays_round_trip() {
        let engine = engine();
        engine.add_delay("register", "localhost:1").unwrap();
        engine.add_delay("register", "localhost:1").unwrap();
        assert!(engine.has_delay("register", "localhost:1").unwrap());
        engine.remove_delay("register", "localhost:1").unwrap();
        assert!(!engine.has_delay("register", "localhost:1").unwrap());
        engine.add_delay("register", "localhost:2").unwrap();
        assert_eq!(engine.clear_delays("register").unwrap(), 1);
    }
}
