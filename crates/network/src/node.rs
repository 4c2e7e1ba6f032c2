//! A node: storage, reputation, approvals and topology behind one handle.

use crate::config::NodeConfig;
use crate::topology::{NodeState, TopologyManager, INTERVIEW_ACTION};
use crate::transport::PeerTransport;
use arbor_security::{Approval, ApprovalService, BehaviorEngine, InputValidator};
use arbor_storage::{record_key, CacheOptions, Database, DatabaseCache, FailPolicy, PruneReport};
use arbor_types::{
    now_ms, AddApprovalInfoRequest, ApprovalInfo, ApprovalInfoResponse, ApprovalKeyResponse,
    ApprovalQuestionRequest, ApprovalQuestionResponse, BanlistEntry, CheckApprovalAnswerRequest,
    GetApprovalInfoRequest, NodeError, NodeResult, PingResponse, StatusResponse, SuccessResponse,
    ARBOR_VERSION,
};
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cache of approver infos fetched while building questions.
pub const APPROVAL_INFO_CACHE: &str = "approval-info";

pub struct Node {
    address: String,
    config: NodeConfig,
    db: Database,
    behavior: Arc<BehaviorEngine>,
    approvals: ApprovalService,
    topology: TopologyManager,
    transport: Arc<dyn PeerTransport>,
    caches: HashMap<String, DatabaseCache>,
    validator: InputValidator,
}

impl Node {
    pub fn new(config: NodeConfig, db: Database, transport: Arc<dyn PeerTransport>) -> NodeResult<Self> {
        let address = config.network.address();
        let behavior = Arc::new(BehaviorEngine::new(db.clone(), config.behavior_config()));
        if behavior.get_fail_options(INTERVIEW_ACTION).is_none() {
            behavior.register_fail(INTERVIEW_ACTION, FailPolicy::default());
        }
        let approvals = ApprovalService::new(db.clone(), address.clone(), &config.approval)?;
        let topology = TopologyManager::new(
            address.clone(),
            db.clone(),
            behavior.clone(),
            transport.clone(),
            config.network.clone(),
        );

        let mut caches: HashMap<String, DatabaseCache> = config
            .cache
            .iter()
            .map(|(name, options)| {
                (
                    name.clone(),
                    DatabaseCache::new(name.clone(), db.clone(), options.clone()),
                )
            })
            .collect();
        if !caches.contains_key(APPROVAL_INFO_CACHE) {
            let lifetime = config
                .approval
                .values()
                .map(|approval| approval.period)
                .max()
                .unwrap_or(Duration::from_secs(5 * 60));
            let options = CacheOptions {
                lifetime,
                ..CacheOptions::default()
            };
            caches.insert(
                APPROVAL_INFO_CACHE.to_string(),
                DatabaseCache::new(APPROVAL_INFO_CACHE, db.clone(), options),
            );
        }

        Ok(Self {
            address,
            config,
            db,
            behavior,
            approvals,
            topology,
            transport,
            caches,
            validator: InputValidator::new(),
        })
    }

    pub fn init(&self) -> NodeResult<()> {
        self.db.init()?;
        self.topology.record_metrics()?;
        info!("Node {} initialized", self.address);
        Ok(())
    }

    pub fn deinit(&self) -> NodeResult<()> {
        self.db.deinit()?;
        info!("Node {} deinitialized", self.address);
        Ok(())
    }

    /// Close and delete the node's database.
    pub fn destroy(&self) -> NodeResult<()> {
        self.db.destroy()?;
        Ok(())
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn behavior(&self) -> &BehaviorEngine {
        &self.behavior
    }

    pub fn topology(&self) -> &TopologyManager {
        &self.topology
    }

    pub fn approvals(&self) -> &ApprovalService {
        &self.approvals
    }

    pub fn validator(&self) -> &InputValidator {
        &self.validator
    }

    pub fn cache(&self, name: &str) -> NodeResult<&DatabaseCache> {
        self.caches
            .get(name)
            .ok_or_else(|| NodeError::NotFound(format!("cache `{name}`")))
    }

    pub fn ping(&self) -> PingResponse {
        PingResponse {
            address: self.address.clone(),
            version: ARBOR_VERSION.to_string(),
        }
    }

    pub fn status(&self) -> NodeResult<StatusResponse> {
        Ok(StatusResponse {
            address: self.address.clone(),
            version: ARBOR_VERSION.to_string(),
            state: self.topology.state().to_string(),
            is_master: self.db.is_master()?,
            network_size: self.topology.network_size()?,
            slaves_count: self.db.get_slaves_count()?,
            masters_count: self.db.get_masters_count()?,
            backlink: self.db.get_backlink()?.map(|backlink| backlink.address),
            availability: self.topology.availability()?,
        })
    }

    pub fn state(&self) -> NodeState {
        self.topology.state()
    }

    pub async fn sync(&self) -> NodeResult<()> {
        self.topology.sync().await
    }

    /// Ban an address for the configured ban lifetime.
    pub async fn ban(&self, address: &str) -> NodeResult<BanlistEntry> {
        self.behavior
            .ban(address, self.config.network.ban_lifetime)
            .await
    }

    /// Peers that may act as approvers: this node and its live links.
    fn approver_candidates(&self) -> NodeResult<Vec<String>> {
        let mut candidates = BTreeSet::new();
        candidates.insert(self.address.clone());
        for server in self.db.get_servers()? {
            if !server.is_broken && (server.is_master || server.is_slave || server.is_backlink) {
                candidates.insert(server.address);
            }
        }
        Ok(candidates.into_iter().collect())
    }

    /// The approvers of `key` as this node sees them.
    fn expected_approvers(&self, approval: &Approval, key: &str) -> NodeResult<Vec<String>> {
        Ok(approval.select_approvers(
            key,
            &self.approver_candidates()?,
            self.topology.network_size()?,
        ))
    }

    /// Distinct entries of `listed`, all of which must be approvers of `key`.
    fn listed_approvers(
        &self,
        approval: &Approval,
        action: &str,
        key: &str,
        listed: &[String],
    ) -> NodeResult<(Vec<String>, usize)> {
        let expected = self.expected_approvers(approval, key)?;
        let mut approvers: Vec<String> = Vec::new();
        for address in listed {
            if !expected.contains(address) {
                return Err(NodeError::approval_required(
                    action,
                    format!("{address} is not an approver of the key"),
                ));
            }
            if !approvers.contains(address) {
                approvers.push(address.clone());
            }
        }
        Ok((approvers, approval.decision_count(expected.len())))
    }

    /// First step of the handshake: a fresh key and the approvers the client
    /// has to visit.
    pub fn request_approval_key(&self, action: &str) -> NodeResult<ApprovalKeyResponse> {
        let approval = self.approvals.get(action)?;
        let key = Approval::create_key();
        let started_at = approval.period_start(now_ms());
        let approvers = self.expected_approvers(approval, &key)?;
        debug!("Issued {} approval key with {} approvers", action, approvers.len());
        Ok(ApprovalKeyResponse {
            key,
            started_at,
            approvers,
        })
    }

    /// Sent by the client to every approver.
    pub fn add_approval_info(
        &self,
        request: &AddApprovalInfoRequest,
        client_ip: IpAddr,
    ) -> NodeResult<SuccessResponse> {
        self.approvals.add_info(
            &request.action,
            &request.key,
            request.started_at,
            client_ip,
            &request.info,
        )?;
        Ok(SuccessResponse { success: true })
    }

    pub fn get_approval_info(&self, request: &GetApprovalInfoRequest) -> NodeResult<ApprovalInfoResponse> {
        Ok(ApprovalInfoResponse {
            info: self.approvals.get_info(&request.action, &request.key)?,
        })
    }

    pub fn check_approval_answer(
        &self,
        request: &CheckApprovalAnswerRequest,
    ) -> NodeResult<SuccessResponse> {
        let client_ip: IpAddr = request
            .client_ip
            .parse()
            .map_err(|_| NodeError::Validation(format!("invalid client ip {}", request.client_ip)))?;
        let success = self.approvals.check_answer(
            &request.action,
            &request.key,
            client_ip,
            &request.approvers,
            &request.answer,
            &request.consumer,
        )?;
        Ok(SuccessResponse { success })
    }

    async fn fetch_approval_info(&self, approver: &str, action: &str, key: &str) -> NodeResult<String> {
        if approver == self.address {
            return self.approvals.get_info(action, key);
        }
        let cache = self.cache(APPROVAL_INFO_CACHE)?;
        let cache_key = record_key(&[approver, action, key]);
        if let Some(info) = cache.get::<String>(&cache_key)? {
            return Ok(info);
        }
        let request = GetApprovalInfoRequest {
            action: action.to_string(),
            key: key.to_string(),
        };
        let info = self
            .topology
            .call(approver, self.transport.get_approval_info(approver, &request))
            .await?
            .info;
        cache.set(&cache_key, &info)?;
        Ok(info)
    }

    /// Second step: collect the approvers' infos and build the question.
    /// Approvers that cannot provide their info are left out of the answer,
    /// as long as enough of the key's approvers remain to decide.
    pub async fn request_approval_question(
        &self,
        request: &ApprovalQuestionRequest,
        client_ip: IpAddr,
    ) -> NodeResult<ApprovalQuestionResponse> {
        let approval = self.approvals.get(&request.action)?;
        let (approvers, needed) = self.listed_approvers(
            approval,
            &request.action,
            &request.key,
            &request.confirmed_addresses,
        )?;

        let fetched = join_all(
            approvers
                .iter()
                .map(|approver| self.fetch_approval_info(approver, &request.action, &request.key)),
        )
        .await;

        let mut infos = Vec::new();
        let mut confirmed = Vec::new();
        for (approver, result) in approvers.into_iter().zip(fetched) {
            match result.and_then(|info| {
                approval.validate_approver_info(&info)?;
                Ok(info)
            }) {
                Ok(info) => {
                    infos.push(info);
                    confirmed.push(approver);
                }
                Err(err) => warn!("Approver {} gave no usable info: {}", approver, err),
            }
        }
        if confirmed.len() < needed {
            return Err(NodeError::approval_required(
                &request.action,
                format!("{} of {needed} approvers confirmed the key", confirmed.len()),
            ));
        }
        Ok(ApprovalQuestionResponse {
            question: approval.create_question(&infos, client_ip)?,
            approvers: confirmed,
        })
    }

    async fn confirm_answer(&self, approver: &str, request: &CheckApprovalAnswerRequest) -> bool {
        let result = if approver == self.address {
            self.check_approval_answer(request)
        } else {
            self.topology
                .call(approver, self.transport.check_approval_answer(approver, request))
                .await
        };
        match result {
            Ok(response) => response.success,
            Err(err) => {
                debug!("Approver {} did not confirm: {}", approver, err);
                false
            }
        }
    }

    /// Final step, run by the node serving the protected request: every
    /// listed approver must belong to the key, and enough of the key's
    /// approvers must confirm the answer.
    pub async fn verify_approval(&self, info: &ApprovalInfo, client_ip: IpAddr) -> NodeResult<()> {
        let approval = self.approvals.get(&info.action)?;
        approval.check_started_at(info.started_at, now_ms())?;
        if approval.validate_client_answer(&info.answer).is_err() {
            return Err(NodeError::approval_required(&info.action, "malformed answer"));
        }
        let (approvers, needed) =
            self.listed_approvers(approval, &info.action, &info.key, &info.approvers)?;
        if approvers.is_empty() {
            return Err(NodeError::approval_required(&info.action, "no approvers listed"));
        }

        let request = CheckApprovalAnswerRequest {
            action: info.action.clone(),
            key: info.key.clone(),
            client_ip: client_ip.to_string(),
            approvers: approvers.clone(),
            answer: info.answer.clone(),
            consumer: self.address.clone(),
        };
        let confirmations = join_all(
            approvers
                .iter()
                .map(|approver| self.confirm_answer(approver, &request)),
        )
        .await
        .into_iter()
        .filter(|confirmed| *confirmed)
        .count();

        if confirmations < needed {
            return Err(NodeError::approval_required(
                &info.action,
                format!("{confirmations} of {needed} approvers confirmed"),
            ));
        }
        Ok(())
    }

    pub fn normalize_servers(&self) -> NodeResult<PruneReport> {
        self.topology.normalize()
    }

    pub fn normalize_banlist(&self) -> NodeResult<PruneReport> {
        self.behavior.normalize_banlist()
    }

    pub fn normalize_behavior_candidates(&self) -> NodeResult<PruneReport> {
        self.behavior
            .normalize_candidates(self.topology.network_size()?)
    }

    pub fn normalize_behavior_fails(&self) -> NodeResult<Vec<BanlistEntry>> {
        self.behavior.normalize_fails()
    }

    pub fn normalize_approval(&self) -> NodeResult<PruneReport> {
        self.approvals.normalize()
    }

    pub fn normalize_caches(&self) -> NodeResult<Vec<PruneReport>> {
        self.caches
            .values()
            .map(|cache| Ok(cache.normalize()?))
            .collect()
    }

    /// Run every sweep once. A failing sweep is logged and does not stop the
    /// others.
    pub fn normalize(&self) {
        let mut reports = Vec::new();
        let mut collect = |name: &str, result: NodeResult<Vec<PruneReport>>| match result {
            Ok(mut found) => reports.append(&mut found),
            Err(err) => warn!("Normalize {} failed: {}", name, err),
        };
        collect("servers", self.normalize_servers().map(|r| vec![r]));
        collect("banlist", self.normalize_banlist().map(|r| vec![r]));
        collect(
            "behavior candidates",
            self.normalize_behavior_candidates().map(|r| vec![r]),
        );
        collect("approval", self.normalize_approval().map(|r| vec![r]));
        collect("cache", self.normalize_caches());
        match self.normalize_behavior_fails() {
            Ok(banned) => {
                for entry in banned {
                    info!("Banned {} after repeated fails", entry.address);
                }
            }
            Err(err) => warn!("Normalize behavior fails failed: {}", err),
        }
        for report in reports {
            if report.pruned_entries > 0 || report.updated_entries > 0 || report.failed_entries > 0 {
                debug!(
                    "Normalized {}: pruned {}, updated {}, failed {}",
                    report.target.name(),
                    report.pruned_entries,
                    report.updated_entries,
                    report.failed_entries
                );
            }
        }
    }

    /// Leave the network before shutting down.
    pub fn deregister(&self) -> NodeResult<()> {
        self.topology.deregister()
    }
}
