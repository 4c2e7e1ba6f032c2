//! Approval gate: a key per `(action, client)`, approver-side challenge
//! records and the scheme that builds questions and checks answers.

pub mod captcha;
pub mod client;
pub mod font;

pub use captcha::{split_slices, CaptchaClientInfo, CaptchaOptions};

use arbor_storage::{ApprovalUse, Database, PruneReport};
use arbor_types::{
    closest_period_time, duration_serde, now_ms, ApprovalRecord, NodeError, NodeResult,
    SizeValue, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum ApprovalError {
    #[error("invalid approval info: {0}")]
    InvalidInfo(String),
    #[error("invalid approval answer: {0}")]
    InvalidAnswer(String),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl From<ApprovalError> for NodeError {
    fn from(err: ApprovalError) -> Self {
        NodeError::Validation(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemeKind {
    /// IP proof.
    #[default]
    Client,
    /// Split captcha.
    Captcha,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub scheme: SchemeKind,
    /// Bucket size for key start times; also the lifetime of approver records.
    #[serde(with = "duration_serde")]
    pub period: Duration,
    pub approvers_count: SizeValue,
    /// Share of the approvers that must confirm an answer.
    pub decision_level: SizeValue,
    pub captcha: CaptchaOptions,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            scheme: SchemeKind::Client,
            period: Duration::from_secs(5 * 60),
            approvers_count: SizeValue::Auto,
            decision_level: SizeValue::Percent(66.6),
            captcha: CaptchaOptions::default(),
        }
    }
}

/// One protected action and its scheme.
#[derive(Debug, Clone)]
pub struct Approval {
    action: String,
    config: ApprovalConfig,
}

impl Approval {
    pub fn new(action: impl Into<String>, config: ApprovalConfig) -> Result<Self, ApprovalError> {
        if config.period.is_zero() {
            return Err(ApprovalError::InvalidInfo(
                "approval period must be positive".to_string(),
            ));
        }
        if config.scheme == SchemeKind::Captcha {
            config.captcha.validate()?;
        }
        Ok(Self {
            action: action.into(),
            config,
        })
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn config(&self) -> &ApprovalConfig {
        &self.config
    }

    pub fn scheme(&self) -> SchemeKind {
        self.config.scheme
    }

    pub fn create_key() -> String {
        hex::encode(rand::random::<[u8; 16]>())
    }

    pub fn period_start(&self, now: Timestamp) -> Timestamp {
        closest_period_time(now, self.config.period)
    }

    /// A key start time is accepted for the current and the previous period.
    pub fn check_started_at(&self, started_at: Timestamp, now: Timestamp) -> NodeResult<()> {
        let current = self.period_start(now);
        let previous = current.saturating_sub(self.config.period.as_millis() as u64);
        if started_at == current || started_at == previous {
            return Ok(());
        }
        Err(NodeError::approval_required(
            &self.action,
            "approval key start time is outdated",
        ))
    }

    pub fn is_expired(&self, record: &ApprovalRecord, now: Timestamp) -> bool {
        now.saturating_sub(record.updated_at) > self.config.period.as_millis() as u64
    }

    pub fn approvers_count(&self, network_size: u64) -> usize {
        self.config.approvers_count.resolve(network_size).max(1) as usize
    }

    /// Order candidates by `blake3(key ‖ address)` and keep the configured
    /// number. Every node computes the same list for a key.
    pub fn select_approvers(&self, key: &str, candidates: &[String], network_size: u64) -> Vec<String> {
        let mut ranked: Vec<(blake3::Hash, &String)> = candidates
            .iter()
            .map(|address| {
                let mut hasher = blake3::Hasher::new();
                hasher.update(key.as_bytes());
                hasher.update(address.as_bytes());
                (hasher.finalize(), address)
            })
            .collect();
        ranked.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()).then(a.1.cmp(b.1)));
        ranked.dedup_by(|a, b| a.1 == b.1);
        ranked
            .into_iter()
            .take(self.approvers_count(network_size))
            .map(|(_, address)| address.clone())
            .collect()
    }

    /// Confirmations needed out of `approvers`.
    pub fn decision_count(&self, approvers: usize) -> usize {
        self.config.decision_level.resolve(approvers as u64).max(1) as usize
    }

    pub fn validate_client_info(&self, info: &serde_json::Value) -> Result<(), ApprovalError> {
        match self.config.scheme {
            SchemeKind::Client => client::validate_client_info(info),
            SchemeKind::Captcha => CaptchaClientInfo::from_value(info).map(|_| ()),
        }
    }

    /// Challenge payload and expected answer.
    pub fn create_info(
        &self,
        client_ip: IpAddr,
        info: &serde_json::Value,
    ) -> Result<(String, String), ApprovalError> {
        match self.config.scheme {
            SchemeKind::Client => {
                client::validate_client_info(info)?;
                Ok(client::create_info(client_ip))
            }
            SchemeKind::Captcha => self.config.captcha.create_info(info),
        }
    }

    /// Question from the approver infos, in approver order.
    pub fn create_question(&self, infos: &[String], client_ip: IpAddr) -> Result<String, ApprovalError> {
        match self.config.scheme {
            SchemeKind::Client => Ok(client::create_question(client_ip)),
            SchemeKind::Captcha => self.config.captcha.create_question(infos),
        }
    }

    pub fn check_answer(&self, answer: &str, stored: &str, approvers: &[String], own_address: &str) -> bool {
        match self.config.scheme {
            SchemeKind::Client => client::check_answer(answer, stored),
            SchemeKind::Captcha => self
                .config
                .captcha
                .check_answer(answer, stored, approvers, own_address),
        }
    }

    pub fn validate_client_answer(&self, answer: &str) -> Result<(), ApprovalError> {
        match self.config.scheme {
            SchemeKind::Client => client::validate_client_answer(answer),
            SchemeKind::Captcha => self.config.captcha.validate_client_answer(answer),
        }
    }

    pub fn validate_approver_info(&self, info: &str) -> Result<(), ApprovalError> {
        match self.config.scheme {
            SchemeKind::Client => client::validate_approver_info(info),
            SchemeKind::Captcha => captcha::validate_approver_info(info),
        }
    }
}

/// Approver side of the handshake.
pub struct ApprovalService {
    db: Database,
    own_address: String,
    approvals: HashMap<String, Approval>,
}

impl ApprovalService {
    pub fn new(
        db: Database,
        own_address: impl Into<String>,
        configs: &HashMap<String, ApprovalConfig>,
    ) -> Result<Self, ApprovalError> {
        let approvals = configs
            .iter()
            .map(|(action, config)| Ok((action.clone(), Approval::new(action, config.clone())?)))
            .collect::<Result<HashMap<_, _>, ApprovalError>>()?;
        Ok(Self {
            db,
            own_address: own_address.into(),
            approvals,
        })
    }

    pub fn get(&self, action: &str) -> NodeResult<&Approval> {
        self.approvals
            .get(action)
            .ok_or_else(|| NodeError::NotFound(format!("approval action `{action}`")))
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.approvals.keys().map(String::as_str)
    }

    /// Create the challenge for `client_ip`, replacing any earlier one of the
    /// same action.
    pub fn add_info(
        &self,
        action: &str,
        key: &str,
        started_at: Timestamp,
        client_ip: IpAddr,
        info: &serde_json::Value,
    ) -> NodeResult<ApprovalRecord> {
        let approval = self.get(action)?;
        let now = now_ms();
        approval.check_started_at(started_at, now)?;
        let (info, answer) = approval.create_info(client_ip, info)?;
        let record = self.db.add_approval(ApprovalRecord {
            action: action.to_string(),
            client_ip,
            key: key.to_string(),
            started_at,
            info,
            answer,
            used_by: Vec::new(),
            updated_at: now,
        })?;
        debug!("Stored {} approval info for {}", action, record.client_ip);
        Ok(record)
    }

    pub fn get_info(&self, action: &str, key: &str) -> NodeResult<String> {
        let approval = self.get(action)?;
        let now = now_ms();
        self.db
            .get_approval(action, key)?
            .filter(|record| !approval.is_expired(record, now))
            .map(|record| record.info)
            .ok_or_else(|| NodeError::NotFound(format!("approval info for key {key}")))
    }

    /// Confirm `answer` for the client and bind the approval to `consumer`.
    pub fn check_answer(
        &self,
        action: &str,
        key: &str,
        client_ip: IpAddr,
        approvers: &[String],
        answer: &str,
        consumer: &str,
    ) -> NodeResult<bool> {
        let approval = self.get(action)?;
        let now = now_ms();
        let Some(record) = self.db.get_client_approval(action, client_ip)? else {
            return Ok(false);
        };
        if record.key != key || approval.is_expired(&record, now) {
            return Ok(false);
        }
        if approval.validate_client_answer(answer).is_err()
            || !approval.check_answer(answer, &record.answer, approvers, &self.own_address)
        {
            return Ok(false);
        }
        match self.db.consume_approval(action, client_ip, key, consumer)? {
            ApprovalUse::Accepted(_) => Ok(true),
            ApprovalUse::AlreadyUsed => {
                debug!("Approval {} already consumed, refused for {}", key, consumer);
                Ok(false)
            }
            ApprovalUse::Missing => Ok(false),
        }
    }

    pub fn normalize(&self) -> NodeResult<PruneReport> {
        Ok(self.db.normalize_approval(|action| {
            self.approvals.get(action).map(|approval| approval.config.period)
        })?)
    }
}
