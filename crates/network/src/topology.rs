//! Membership: slaves, masters, the backlink and the registration protocol.

use crate::config::NetworkConfig;
use crate::metrics;
use crate::transport::PeerTransport;
use arbor_security::BehaviorEngine;
use arbor_storage::{Database, PruneReport, ServerSweep};
use arbor_types::{
    ErrorKind, InterviewRequest, InterviewSummary, MasterInfo, MasterOrigin, NodeError,
    NodeResult, ProvideRegistrationRequest, RegisterRequest, RegisterResponse,
    RegistrationCandidates, ServerRecord, Structure, StructureReport, StructureRequest,
};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Behavior action used for registration throttling.
pub const REGISTER_ACTION: &str = "register";
/// Fail action counted against peers that fail our interview.
pub const INTERVIEW_ACTION: &str = "interview";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// No backlink.
    Standalone,
    Interviewing,
    Registered,
    Deregistering,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Standalone => "standalone",
            NodeState::Interviewing => "interviewing",
            NodeState::Registered => "registered",
            NodeState::Deregistering => "deregistering",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct TopologyManager {
    address: String,
    db: Database,
    behavior: Arc<BehaviorEngine>,
    transport: Arc<dyn PeerTransport>,
    config: NetworkConfig,
    state: RwLock<NodeState>,
}

impl TopologyManager {
    pub fn new(
        address: impl Into<String>,
        db: Database,
        behavior: Arc<BehaviorEngine>,
        transport: Arc<dyn PeerTransport>,
        config: NetworkConfig,
    ) -> Self {
        Self {
            address: address.into(),
            db,
            behavior,
            transport,
            config,
            state: RwLock::new(NodeState::Standalone),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    fn set_state(&self, state: NodeState) {
        let mut current = self.state.write();
        if *current != state {
            debug!("Node state {} -> {}", *current, state);
            *current = state;
        }
    }

    /// `1 + Σ size` over the known masters, this node included when it has
    /// slaves.
    pub fn network_size(&self) -> NodeResult<u64> {
        let mut size = 1 + self.db.get_slaves_count()?;
        for master in self.db.get_masters()? {
            if master.address != self.address {
                size += master.size;
            }
        }
        Ok(size)
    }

    pub fn slaves_limit(&self, network_size: u64) -> u64 {
        self.config.slaves_limit.resolve(network_size).max(1)
    }

    /// Share of free slave slots, 0 to 100.
    pub fn availability(&self) -> NodeResult<f64> {
        let capacity = self.slaves_limit(self.network_size()?);
        let used = self.db.get_slaves_count()?.min(capacity);
        Ok((capacity - used) as f64 * 100.0 / capacity as f64)
    }

    /// Ancestors of this node, nearest first.
    pub fn chain(&self) -> NodeResult<Vec<String>> {
        Ok(match self.db.get_backlink()? {
            Some(backlink) => {
                let mut chain = Vec::with_capacity(backlink.chain.len() + 1);
                chain.push(backlink.address);
                chain.extend(backlink.chain);
                chain
            }
            None => Vec::new(),
        })
    }

    pub fn is_broken(&self, address: &str) -> NodeResult<bool> {
        Ok(self
            .db
            .get_server(address)?
            .is_some_and(|server| server.is_broken))
    }

    /// Await a peer request, keeping the peer's fail counter in step.
    /// Bookkeeping errors are logged; the request's own outcome is returned.
    pub(crate) async fn call<T>(
        &self,
        address: &str,
        request: impl Future<Output = NodeResult<T>>,
    ) -> NodeResult<T> {
        match request.await {
            Ok(value) => {
                if let Err(err) = self.db.success_server_address(address) {
                    warn!("Could not reset fails of {}: {}", address, err);
                }
                Ok(value)
            }
            Err(err) => {
                if err.kind() == ErrorKind::Transport {
                    metrics::record_peer_failure();
                    match self
                        .db
                        .failed_server_address(address, self.config.server_max_fails)
                    {
                        Ok(Some(server)) if server.is_broken => {
                            warn!("Peer {} is broken after {} fails", address, server.fails);
                        }
                        Ok(_) => {}
                        Err(db_err) => {
                            warn!("Could not count fail of {}: {}", address, db_err);
                        }
                    }
                }
                Err(err)
            }
        }
    }

    pub fn interview_summary(&self, request: &InterviewRequest) -> NodeResult<InterviewSummary> {
        let network_size = self.network_size()?;
        Ok(InterviewSummary {
            address: self.address.clone(),
            chain: self.chain()?,
            slaves_count: self.db.get_slaves_count()?,
            capacity: self.slaves_limit(network_size.max(request.network_size)),
            availability: self.availability()?,
            network_size,
        })
    }

    /// Peers `target` may try to register with: this node and the healthy
    /// peers it knows.
    pub fn provide_registration(
        &self,
        request: &ProvideRegistrationRequest,
    ) -> NodeResult<RegistrationCandidates> {
        let target = request.target.as_str();
        let mut candidates = BTreeSet::new();
        if self.address != target {
            candidates.insert(self.address.clone());
        }
        for server in self.db.get_servers()? {
            if !server.is_broken && server.has_role() && server.address != target {
                candidates.insert(server.address);
            }
        }
        Ok(RegistrationCandidates {
            network_size: self.network_size()?,
            candidates: candidates.into_iter().collect(),
        })
    }

    /// Master side of registration.
    pub async fn accept_registration(&self, request: &RegisterRequest) -> NodeResult<RegisterResponse> {
        let target = request.target.as_str();
        if target == self.address {
            return Err(NodeError::Validation(
                "a node cannot register with itself".to_string(),
            ));
        }
        let chain = self.chain()?;
        if chain.iter().any(|ancestor| ancestor == target) {
            return Err(NodeError::Interview(format!(
                "{target} is an ancestor of {}",
                self.address
            )));
        }

        let network_size = self.network_size()?;
        let interview = InterviewRequest { network_size };
        let summary = match self
            .call(target, self.transport.get_interview_summary(target, &interview))
            .await
        {
            Ok(summary) if summary.address == target => summary,
            Ok(summary) => {
                self.fail_interview(target);
                return Err(NodeError::Interview(format!(
                    "{target} answered the interview as {}",
                    summary.address
                )));
            }
            Err(err) => {
                self.fail_interview(target);
                return Err(NodeError::Interview(format!(
                    "{target} failed the interview: {err}"
                )));
            }
        };
        if summary.chain.iter().any(|ancestor| ancestor == target) {
            return Err(NodeError::Interview(format!("{target} reports a looped chain")));
        }

        if self.db.has_slave(target)? {
            self.db.add_slave(target, request.availability, None)?;
        } else {
            let capacity = self.slaves_limit(network_size);
            if self.db.get_slaves_count()? >= capacity {
                self.behavior
                    .add_candidate(REGISTER_ACTION, target, network_size)?;
                if !self
                    .behavior
                    .is_validated_candidate(REGISTER_ACTION, target, network_size)?
                {
                    return Err(NodeError::Interview(format!(
                        "{} has no free slave slots",
                        self.address
                    )));
                }
                info!("Admitting persistent candidate {} over capacity", target);
            }
            self.db.add_slave(target, request.availability, Some(capacity))?;
            info!("Registered slave {}", target);
        }
        if self.behavior.get_fail_options(INTERVIEW_ACTION).is_some() {
            self.behavior.sub_fail(INTERVIEW_ACTION, target, 1.0)?;
        }

        let size = self.db.get_slaves_count()?;
        self.record_metrics()?;
        Ok(RegisterResponse {
            address: self.address.clone(),
            chain,
            size,
        })
    }

    fn fail_interview(&self, target: &str) {
        if self.behavior.get_fail_options(INTERVIEW_ACTION).is_none() {
            return;
        }
        if let Err(err) = self.behavior.add_fail(INTERVIEW_ACTION, target, 1.0) {
            warn!("Failed to record interview fail of {}: {}", target, err);
        }
    }

    /// Joiner side of registration: collect candidates from the initial
    /// addresses, interview them and register with the best one.
    pub async fn register(&self) -> NodeResult<RegisterResponse> {
        self.set_state(NodeState::Interviewing);
        match self.try_register().await {
            Ok(response) => {
                self.set_state(NodeState::Registered);
                Ok(response)
            }
            Err(err) => {
                self.set_state(NodeState::Standalone);
                Err(err)
            }
        }
    }

    fn initial_addresses(&self) -> Vec<String> {
        self.config
            .initial_addresses
            .iter()
            .filter(|address| **address != self.address)
            .cloned()
            .collect()
    }

    async fn try_register(&self) -> NodeResult<RegisterResponse> {
        let network_size = self.network_size()?;
        let request = ProvideRegistrationRequest {
            target: self.address.clone(),
        };
        let initial = self.initial_addresses();
        let provided = join_all(initial.iter().map(|address| {
            self.call(address, self.transport.provide_registration(address, &request))
        }))
        .await;

        let mut candidates = BTreeSet::new();
        for (address, result) in initial.iter().zip(provided) {
            match result {
                Ok(list) => candidates.extend(list.candidates),
                Err(err) => warn!("Initial address {} refused candidates: {}", address, err),
            }
        }
        candidates.remove(&self.address);
        if candidates.is_empty() {
            return Err(NodeError::Interview(
                "no registration candidates available".to_string(),
            ));
        }

        let interview = InterviewRequest { network_size };
        let candidates: Vec<String> = candidates.into_iter().collect();
        let summaries = join_all(candidates.iter().map(|address| {
            self.call(address, self.transport.get_interview_summary(address, &interview))
        }))
        .await;

        let mut delayed = 0;
        let mut ranked: Vec<InterviewSummary> = Vec::new();
        for (address, result) in candidates.iter().zip(summaries) {
            let summary = match result {
                Ok(summary) => summary,
                Err(err) => {
                    debug!("Candidate {} failed the interview: {}", address, err);
                    continue;
                }
            };
            if summary.address != *address
                || summary.chain.iter().any(|ancestor| *ancestor == self.address)
                || self.is_broken(address)?
            {
                continue;
            }
            if self.behavior.has_delay(REGISTER_ACTION, address)? {
                delayed += 1;
                continue;
            }
            ranked.push(summary);
        }
        ranked.sort_by(|a, b| {
            let key = |s: &InterviewSummary| (s.headroom() == 0, s.chain_depth(), Reverse(s.headroom()));
            key(a).cmp(&key(b)).then(
                b.availability
                    .partial_cmp(&a.availability)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });

        let availability = self.availability()?;
        let register = RegisterRequest {
            target: self.address.clone(),
            availability,
        };
        for summary in ranked {
            let address = summary.address.as_str();
            match self
                .call(address, self.transport.register(address, &register))
                .await
            {
                Ok(response) => {
                    self.db.add_backlink(&response.address, response.chain.clone())?;
                    self.db.remove_masters(Some(MasterOrigin::Upstream))?;
                    self.db
                        .add_master(&response.address, response.size, MasterOrigin::Upstream)?;
                    self.behavior.clear_delays(REGISTER_ACTION)?;
                    metrics::record_registration();
                    self.record_metrics()?;
                    info!("Registered with master {}", response.address);
                    return Ok(response);
                }
                Err(err) => {
                    debug!("Registration with {} failed: {}", address, err);
                    self.behavior.add_delay(REGISTER_ACTION, address)?;
                }
            }
        }

        if delayed > 0 {
            // Every candidate gets another chance on the next attempt.
            self.behavior.clear_delays(REGISTER_ACTION)?;
        }
        Err(NodeError::Interview(
            "no candidate accepted the registration".to_string(),
        ))
    }

    /// Masters in this node's subtree, itself first when it has slaves.
    fn subtree_masters(&self) -> NodeResult<Vec<MasterInfo>> {
        let mut masters = Vec::new();
        let slaves = self.db.get_slaves_count()?;
        if slaves > 0 {
            masters.push(MasterInfo {
                address: self.address.clone(),
                size: slaves,
            });
        }
        for master in self.db.get_masters()? {
            if master.master_origin == MasterOrigin::Downstream && !master.is_broken {
                masters.push(master_info(&master));
            }
        }
        Ok(masters)
    }

    pub fn report(&self) -> NodeResult<StructureReport> {
        Ok(StructureReport {
            address: self.address.clone(),
            size: self.db.get_slaves_count()?,
            availability: self.availability()?,
            masters: self.subtree_masters()?,
        })
    }

    fn accept_report(&self, report: &StructureReport) -> NodeResult<()> {
        if !self.db.has_slave(&report.address)? {
            debug!("Ignoring structure report of non-slave {}", report.address);
            return Ok(());
        }
        self.db.add_slave(&report.address, report.availability, None)?;
        if report.size == 0 {
            self.db.remove_master(&report.address)?;
        }
        for master in &report.masters {
            if master.address == self.address {
                continue;
            }
            self.db
                .add_master(&master.address, master.size, MasterOrigin::Downstream)?;
        }
        Ok(())
    }

    /// Snapshot answered to peers. A report attached by a slave is merged
    /// first.
    pub fn structure(&self, request: &StructureRequest) -> NodeResult<Structure> {
        if let Some(report) = &request.report {
            self.accept_report(report)?;
        }
        let slaves: Vec<String> = self
            .db
            .get_slaves()?
            .into_iter()
            .map(|slave| slave.address)
            .collect();
        let mut masters = Vec::new();
        if !slaves.is_empty() {
            masters.push(MasterInfo {
                address: self.address.clone(),
                size: slaves.len() as u64,
            });
        }
        for master in self.db.get_masters()? {
            if !master.is_broken && master.address != self.address {
                masters.push(master_info(&master));
            }
        }
        Ok(Structure {
            address: self.address.clone(),
            chain: self.chain()?,
            backlink: self.db.get_backlink()?.map(|backlink| backlink.address),
            is_master: !slaves.is_empty(),
            size: slaves.len() as u64,
            masters,
            slaves,
        })
    }

    /// Replace upstream knowledge with the masters announced by the backlink.
    fn apply_structure(&self, structure: &Structure) -> NodeResult<()> {
        self.db
            .update_backlink_chain(&structure.address, structure.chain.clone())?;
        let incoming: Vec<&MasterInfo> = structure
            .masters
            .iter()
            .filter(|master| master.address != self.address)
            .collect();
        for master in self.db.get_masters()? {
            if master.master_origin == MasterOrigin::Upstream
                && !incoming.iter().any(|m| m.address == master.address)
            {
                self.db.remove_master(&master.address)?;
            }
        }
        for master in incoming {
            let known_downstream = self
                .db
                .get_master(&master.address)?
                .is_some_and(|record| record.master_origin == MasterOrigin::Downstream);
            if !known_downstream {
                self.db
                    .add_master(&master.address, master.size, MasterOrigin::Upstream)?;
            }
        }
        Ok(())
    }

    /// Forget the backlink and everything learned through it.
    fn lose_backlink(&self) -> NodeResult<()> {
        if let Some(backlink) = self.db.remove_backlink()? {
            info!("Lost backlink {}", backlink.address);
        }
        self.db.remove_masters(Some(MasterOrigin::Upstream))?;
        self.set_state(NodeState::Standalone);
        Ok(())
    }

    /// Periodic re-validation of every link.
    pub async fn sync(&self) -> NodeResult<()> {
        if self.state() == NodeState::Deregistering {
            return Ok(());
        }

        match self.db.get_backlink()? {
            None => self.register_if_needed().await,
            Some(backlink) => {
                let request = StructureRequest {
                    report: Some(self.report()?),
                };
                let result = self
                    .call(&backlink.address, self.transport.get_structure(&backlink.address, &request))
                    .await;
                match result {
                    Ok(structure)
                        if structure.address == backlink.address
                            && structure.slaves.iter().any(|s| *s == self.address) =>
                    {
                        self.apply_structure(&structure)?;
                        self.set_state(NodeState::Registered);
                    }
                    Ok(_) => {
                        info!("Backlink {} no longer lists this node", backlink.address);
                        self.lose_backlink()?;
                        self.register_if_needed().await;
                    }
                    Err(err) => {
                        if err.kind() == ErrorKind::Transport && !self.is_broken(&backlink.address)? {
                            warn!("Backlink {} unreachable: {}", backlink.address, err);
                        } else {
                            warn!("Dropping backlink {}: {}", backlink.address, err);
                            self.lose_backlink()?;
                            self.register_if_needed().await;
                        }
                    }
                }
            }
        }

        self.check_masters().await?;
        self.shift_slaves()?;
        self.record_metrics()?;
        Ok(())
    }

    async fn register_if_needed(&self) {
        if self.initial_addresses().is_empty() {
            self.set_state(NodeState::Standalone);
            return;
        }
        if let Err(err) = self.register().await {
            warn!("Registration failed: {}", err);
        }
    }

    /// Ping every master except the backlink; broken ones lose the role.
    async fn check_masters(&self) -> NodeResult<()> {
        let masters: Vec<ServerRecord> = self
            .db
            .get_masters()?
            .into_iter()
            .filter(|master| !master.is_backlink)
            .collect();
        let pings = join_all(
            masters
                .iter()
                .map(|master| self.call(&master.address, self.transport.ping(&master.address))),
        )
        .await;
        for (master, result) in masters.iter().zip(pings) {
            if result.is_err() && self.is_broken(&master.address)? {
                info!("Demoting unresponsive master {}", master.address);
                self.db.remove_master(&master.address)?;
            }
        }
        Ok(())
    }

    /// Drop the oldest-registered slaves beyond the current capacity.
    pub fn shift_slaves(&self) -> NodeResult<Vec<ServerRecord>> {
        let capacity = self.slaves_limit(self.network_size()?);
        let count = self.db.get_slaves_count()?;
        if count <= capacity {
            return Ok(Vec::new());
        }
        let shifted = self.db.shift_slaves((count - capacity) as usize)?;
        for slave in &shifted {
            info!("Shifted slave {} over capacity {}", slave.address, capacity);
        }
        Ok(shifted)
    }

    /// Leave the network: drop every link and stop syncing.
    pub fn deregister(&self) -> NodeResult<()> {
        self.set_state(NodeState::Deregistering);
        self.db.remove_backlink()?;
        self.db.remove_masters(None)?;
        self.db.remove_slaves()?;
        self.record_metrics()?;
        info!("Deregistered {}", self.address);
        Ok(())
    }

    /// The known peer with the most free capacity, this node included.
    pub fn available_node(&self) -> NodeResult<String> {
        let mut best = (self.address.clone(), self.availability()?);
        for slave in self.db.get_slaves()? {
            if !slave.is_broken && slave.availability > best.1 {
                best = (slave.address, slave.availability);
            }
        }
        Ok(best.0)
    }

    pub fn sweep_options(&self) -> ServerSweep {
        ServerSweep {
            own_address: self.address.clone(),
            max_fails: self.config.server_max_fails,
            slave_lifetime: Some(self.config.slave_lifetime()),
            master_lifetime: Some(self.config.master_lifetime()),
        }
    }

    pub fn normalize(&self) -> NodeResult<PruneReport> {
        Ok(self.db.normalize_servers(&self.sweep_options())?)
    }

    pub fn record_metrics(&self) -> NodeResult<()> {
        metrics::record_structure(
            self.network_size()?,
            self.db.get_slaves_count()?,
            self.db.get_masters_count()?,
        );
        Ok(())
    }
}

fn master_info(record: &ServerRecord) -> MasterInfo {
    MasterInfo {
        address: record.address.clone(),
        size: record.size,
    }
}
