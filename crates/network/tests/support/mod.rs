//! In-process network: node-to-node calls go straight to the target `Node`.

#![allow(dead_code)]

use arbor_network::{NetworkConfig, Node, NodeConfig, PeerTransport};
use arbor_storage::Database;
use arbor_types::{
    ApprovalInfoResponse, CheckApprovalAnswerRequest, GetApprovalInfoRequest, InterviewRequest,
    InterviewSummary, NodeError, NodeResult, PingResponse, ProvideRegistrationRequest,
    RegisterRequest, RegisterResponse, RegistrationCandidates, SizeValue, Structure,
    StructureRequest, SuccessResponse,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    offline: RwLock<HashSet<String>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, node: Arc<Node>) {
        self.nodes.write().insert(node.address().to_string(), node);
    }

    pub fn set_offline(&self, address: &str, offline: bool) {
        if offline {
            self.offline.write().insert(address.to_string());
        } else {
            self.offline.write().remove(address);
        }
    }

    pub fn node(&self, address: &str) -> NodeResult<Arc<Node>> {
        if self.offline.read().contains(address) {
            return Err(NodeError::Transport(format!("{address} is offline")));
        }
        self.nodes
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| NodeError::Transport(format!("{address} is unreachable")))
    }
}

#[async_trait]
impl PeerTransport for LocalTransport {
    async fn ping(&self, address: &str) -> NodeResult<PingResponse> {
        Ok(self.node(address)?.ping())
    }

    async fn get_interview_summary(
        &self,
        address: &str,
        request: &InterviewRequest,
    ) -> NodeResult<InterviewSummary> {
        self.node(address)?.topology().interview_summary(request)
    }

    async fn provide_registration(
        &self,
        address: &str,
        request: &ProvideRegistrationRequest,
    ) -> NodeResult<RegistrationCandidates> {
        self.node(address)?.topology().provide_registration(request)
    }

    async fn register(&self, address: &str, request: &RegisterRequest) -> NodeResult<RegisterResponse> {
        let node = self.node(address)?;
        node.topology().accept_registration(request).await
    }

    async fn get_structure(&self, address: &str, request: &StructureRequest) -> NodeResult<Structure> {
        self.node(address)?.topology().structure(request)
    }

    async fn get_approval_info(
        &self,
        address: &str,
        request: &GetApprovalInfoRequest,
    ) -> NodeResult<ApprovalInfoResponse> {
        self.node(address)?.get_approval_info(request)
    }

    async fn check_approval_answer(
        &self,
        address: &str,
        request: &CheckApprovalAnswerRequest,
    ) -> NodeResult<SuccessResponse> {
        self.node(address)?.check_approval_answer(request)
    }
}

pub fn address(port: u16) -> String {
    format!("127.0.0.1:{port}")
}

pub fn config(port: u16, initial: &[u16], slaves_limit: u64) -> NodeConfig {
    NodeConfig {
        network: NetworkConfig {
            port,
            initial_addresses: initial.iter().map(|p| address(*p)).collect(),
            slaves_limit: SizeValue::Fixed(slaves_limit),
            ..NetworkConfig::default()
        },
        ..NodeConfig::default()
    }
}

pub fn spawn(transport: &Arc<LocalTransport>, config: NodeConfig) -> Arc<Node> {
    let node = Arc::new(
        Node::new(config, Database::memory(), transport.clone() as Arc<dyn PeerTransport>)
            .expect("node config is valid"),
    );
    node.init().expect("memory storage initializes");
    transport.add(node.clone());
    node
}
