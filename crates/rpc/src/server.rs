use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use arbor_network::Node;
use arbor_security::{schemas, ValidationRule};
use arbor_types::{
    AddApprovalInfoRequest, ApprovalInfo, ApprovalKeyRequest, ApprovalKeyResponse,
    ApprovalQuestionRequest, ApprovalQuestionResponse, AvailableNodeResponse,
    CheckApprovalAnswerRequest, GetApprovalInfoRequest, ApprovalInfoResponse, InterviewRequest,
    InterviewSummary, NodeError, PingResponse, ProvideRegistrationRequest, RegisterRequest,
    RegisterResponse, RegistrationCandidates, StatusResponse, Structure, StructureRequest,
    SuccessResponse,
};
use axum::extract::{Extension, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ApiError;
use crate::guard::{guard_origin, require_auth, ClientIp};

const MAX_BODY_BYTES: usize = 256 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub node: Arc<Node>,
    /// Set when the Prometheus exporter is installed.
    pub metrics: Option<PrometheusHandle>,
}

pub(crate) type SharedState = Arc<AppState>;

pub async fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        tokio::net::TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {socket_addr}"))
    } else {
        tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {addr}"))
    }
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(state: AppState, listener: tokio::net::TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(local) = listener.local_addr() {
        info!("HTTP server listening on {}", local);
    }
    let app = build_router(Arc::new(state));
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("HTTP server terminated unexpectedly")
}

pub fn build_router(state: SharedState) -> Router {
    let protected = Router::new()
        .route("/status", get(handle_status))
        .route("/api/node/register", post(handle_register))
        .route(
            "/api/node/get-interview-summary",
            post(handle_get_interview_summary),
        )
        .route(
            "/api/node/provide-registration",
            post(handle_provide_registration),
        )
        .route("/api/node/structure", post(handle_structure))
        .route("/api/node/get-approval-info", post(handle_get_approval_info))
        .route(
            "/api/node/check-approval-answer",
            post(handle_check_approval_answer),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/ping", get(handle_ping))
        .route("/metrics", get(handle_metrics))
        .route(
            "/client/request-approval-key",
            post(handle_request_approval_key),
        )
        .route("/client/add-approval-info", post(handle_add_approval_info))
        .route(
            "/client/request-approval-question",
            post(handle_request_approval_question),
        )
        .route("/client/verify-approval", post(handle_verify_approval))
        .route("/client/get-available-node", post(handle_get_available_node))
        .merge(protected)
        .layer(middleware::from_fn_with_state(state.clone(), guard_origin))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Check `body` against `rules`, then decode it.
fn parse<T: DeserializeOwned>(
    state: &AppState,
    body: Value,
    rules: &[ValidationRule],
) -> Result<T, ApiError> {
    state
        .node
        .validator()
        .validate_value(&body, rules)
        .map_err(NodeError::from)?;
    serde_json::from_value(body).map_err(|err| NodeError::Validation(err.to_string()).into())
}

async fn handle_ping(State(state): State<SharedState>) -> Json<PingResponse> {
    Json(state.node.ping())
}

async fn handle_status(State(state): State<SharedState>) -> Result<Json<StatusResponse>, ApiError> {
    Ok(Json(state.node.status()?))
}

async fn handle_metrics(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let Some(handle) = &state.metrics else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "ERR_ARBOR_NOT_FOUND",
            "metrics exporter is disabled",
        ));
    };
    let mut response = handle.render().into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    Ok(response)
}

async fn handle_request_approval_key(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<Json<ApprovalKeyResponse>, ApiError> {
    let request: ApprovalKeyRequest = parse(&state, body, &schemas::approval_action())?;
    Ok(Json(state.node.request_approval_key(&request.action)?))
}

async fn handle_add_approval_info(
    State(state): State<SharedState>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Json(body): Json<Value>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let request: AddApprovalInfoRequest = parse(&state, body, &schemas::add_approval_info())?;
    Ok(Json(state.node.add_approval_info(&request, ip)?))
}

async fn handle_request_approval_question(
    State(state): State<SharedState>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Json(body): Json<Value>,
) -> Result<Json<ApprovalQuestionResponse>, ApiError> {
    let request: ApprovalQuestionRequest = parse(&state, body, &schemas::approval_question())?;
    Ok(Json(state.node.request_approval_question(&request, ip).await?))
}

async fn handle_verify_approval(
    State(state): State<SharedState>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Json(body): Json<Value>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let info: ApprovalInfo = parse(&state, body, &schemas::approval_info())?;
    state.node.verify_approval(&info, ip).await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn handle_get_available_node(
    State(state): State<SharedState>,
) -> Result<Json<AvailableNodeResponse>, ApiError> {
    Ok(Json(AvailableNodeResponse {
        address: state.node.topology().available_node()?,
    }))
}

async fn handle_register(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let request: RegisterRequest = parse(&state, body, &schemas::register())?;
    Ok(Json(state.node.topology().accept_registration(&request).await?))
}

async fn handle_get_interview_summary(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<Json<InterviewSummary>, ApiError> {
    let request: InterviewRequest = parse(&state, body, &[])?;
    Ok(Json(state.node.topology().interview_summary(&request)?))
}

async fn handle_provide_registration(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<Json<RegistrationCandidates>, ApiError> {
    let request: ProvideRegistrationRequest = parse(&state, body, &schemas::target())?;
    Ok(Json(state.node.topology().provide_registration(&request)?))
}

async fn handle_structure(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<Json<Structure>, ApiError> {
    let request: StructureRequest = parse(&state, body, &[])?;
    Ok(Json(state.node.topology().structure(&request)?))
}

async fn handle_get_approval_info(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<Json<ApprovalInfoResponse>, ApiError> {
    let request: GetApprovalInfoRequest = parse(&state, body, &schemas::approval_key())?;
    Ok(Json(state.node.get_approval_info(&request)?))
}

async fn handle_check_approval_answer(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let request: CheckApprovalAnswerRequest =
        parse(&state, body, &schemas::check_approval_answer())?;
    Ok(Json(state.node.check_approval_answer(&request)?))
}
