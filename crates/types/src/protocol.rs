//! Request and response bodies exchanged between nodes and with clients.

use crate::time_service::Timestamp;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    pub address: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterviewRequest {
    /// The asking node's own network size estimate.
    pub network_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterviewSummary {
    pub address: String,
    pub chain: Vec<String>,
    pub slaves_count: u64,
    pub capacity: u64,
    pub availability: f64,
    pub network_size: u64,
}

impl InterviewSummary {
    pub fn chain_depth(&self) -> usize {
        self.chain.len()
    }

    pub fn headroom(&self) -> u64 {
        self.capacity.saturating_sub(self.slaves_count)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvideRegistrationRequest {
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationCandidates {
    pub network_size: u64,
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub target: String,
    #[serde(default)]
    pub availability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub address: String,
    /// The admitting master's own ancestors.
    pub chain: Vec<String>,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterInfo {
    pub address: String,
    pub size: u64,
}

/// Sent by a slave to its backlink on every sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureReport {
    pub address: String,
    pub size: u64,
    pub availability: f64,
    /// Masters living in the reporter's subtree.
    #[serde(default)]
    pub masters: Vec<MasterInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StructureRequest {
    #[serde(default)]
    pub report: Option<StructureReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    pub address: String,
    pub chain: Vec<String>,
    pub backlink: Option<String>,
    pub is_master: bool,
    pub size: u64,
    pub masters: Vec<MasterInfo>,
    pub slaves: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub address: String,
    pub version: String,
    pub state: String,
    pub is_master: bool,
    pub network_size: u64,
    pub slaves_count: u64,
    pub masters_count: u64,
    pub backlink: Option<String>,
    pub availability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableNodeResponse {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalKeyRequest {
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalKeyResponse {
    pub key: String,
    pub started_at: Timestamp,
    pub approvers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddApprovalInfoRequest {
    pub action: String,
    pub key: String,
    pub started_at: Timestamp,
    /// Scheme specific client preferences, e.g. captcha dimensions.
    #[serde(default)]
    pub info: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalQuestionRequest {
    pub action: String,
    pub key: String,
    pub confirmed_addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalQuestionResponse {
    pub question: String,
    pub approvers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetApprovalInfoRequest {
    pub action: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalInfoResponse {
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckApprovalAnswerRequest {
    pub action: String,
    pub key: String,
    pub client_ip: String,
    pub approvers: Vec<String>,
    pub answer: String,
    /// Address of the node consuming the approval.
    pub consumer: String,
}

/// Attached by a client to a request for an approval-protected action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalInfo {
    pub action: String,
    pub key: String,
    pub started_at: Timestamp,
    pub approvers: Vec<String>,
    pub answer: String,
}

/// Error body returned over HTTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
