//! Node-to-node calls.

use crate::config::AuthConfig;
use arbor_types::{
    ApprovalInfoResponse, CheckApprovalAnswerRequest, ErrorBody, GetApprovalInfoRequest,
    InterviewRequest, InterviewSummary, NodeError, NodeResult, PingResponse,
    ProvideRegistrationRequest, RegisterRequest, RegisterResponse, RegistrationCandidates,
    Structure, StructureRequest, SuccessResponse,
};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// The requests a node sends to its peers.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn ping(&self, address: &str) -> NodeResult<PingResponse>;

    async fn get_interview_summary(
        &self,
        address: &str,
        request: &InterviewRequest,
    ) -> NodeResult<InterviewSummary>;

    async fn provide_registration(
        &self,
        address: &str,
        request: &ProvideRegistrationRequest,
    ) -> NodeResult<RegistrationCandidates>;

    async fn register(&self, address: &str, request: &RegisterRequest) -> NodeResult<RegisterResponse>;

    async fn get_structure(&self, address: &str, request: &StructureRequest) -> NodeResult<Structure>;

    async fn get_approval_info(
        &self,
        address: &str,
        request: &GetApprovalInfoRequest,
    ) -> NodeResult<ApprovalInfoResponse>;

    async fn check_approval_answer(
        &self,
        address: &str,
        request: &CheckApprovalAnswerRequest,
    ) -> NodeResult<SuccessResponse>;
}

/// JSON over HTTP to the peer's `/api/node/*` routes.
#[derive(Clone)]
pub struct HttpPeerTransport {
    http: Client,
    auth: Option<AuthConfig>,
}

impl HttpPeerTransport {
    pub fn new(timeout: Duration, auth: Option<AuthConfig>) -> NodeResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| NodeError::Transport(err.to_string()))?;
        Ok(Self::with_http_client(http, auth))
    }

    pub fn with_http_client(http: Client, auth: Option<AuthConfig>) -> Self {
        Self { http, auth }
    }

    fn url(address: &str, path: &str) -> String {
        format!("http://{address}{path}")
    }

    async fn post_json<B, T>(&self, address: &str, path: &str, body: &B) -> NodeResult<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let mut request = self.http.post(Self::url(address, path)).json(body);
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }
        let response = request.send().await.map_err(transport_error)?;
        Self::map_response(response).await
    }

    async fn map_response<T>(response: Response) -> NodeResult<T>
    where
        T: DeserializeOwned,
    {
        if !response.status().is_success() {
            return Err(Self::map_api_error(response).await);
        }
        response.json::<T>().await.map_err(transport_error)
    }

    async fn map_api_error(response: Response) -> NodeError {
        let status = response.status();
        let bytes = response.bytes().await.unwrap_or_default();
        if let Ok(body) = serde_json::from_slice::<ErrorBody>(&bytes) {
            return NodeError::from_code(&body.code, body.message);
        }
        NodeError::Transport(format!(
            "status {}: {}",
            status,
            String::from_utf8_lossy(&bytes)
        ))
    }
}

fn transport_error(err: reqwest::Error) -> NodeError {
    NodeError::Transport(err.to_string())
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn ping(&self, address: &str) -> NodeResult<PingResponse> {
        let response = self
            .http
            .get(Self::url(address, "/ping"))
            .send()
            .await
            .map_err(transport_error)?;
        Self::map_response(response).await
    }

    async fn get_interview_summary(
        &self,
        address: &str,
        request: &InterviewRequest,
    ) -> NodeResult<InterviewSummary> {
        self.post_json(address, "/api/node/get-interview-summary", request)
            .await
    }

    async fn provide_registration(
        &self,
        address: &str,
        request: &ProvideRegistrationRequest,
    ) -> NodeResult<RegistrationCandidates> {
        self.post_json(address, "/api/node/provide-registration", request)
            .await
    }

    async fn register(&self, address: &str, request: &RegisterRequest) -> NodeResult<RegisterResponse> {
        self.post_json(address, "/api/node/register", request).await
    }

    async fn get_structure(&self, address: &str, request: &StructureRequest) -> NodeResult<Structure> {
        self.post_json(address, "/api/node/structure", request).await
    }

    async fn get_approval_info(
        &self,
        address: &str,
        request: &GetApprovalInfoRequest,
    ) -> NodeResult<ApprovalInfoResponse> {
        self.post_json(address, "/api/node/get-approval-info", request)
            .await
    }

    async fn check_approval_answer(
        &self,
        address: &str,
        request: &CheckApprovalAnswerRequest,
    ) -> NodeResult<SuccessResponse> {
        self.post_json(address, "/api/node/check-approval-answer", request)
            .await
    }
}
