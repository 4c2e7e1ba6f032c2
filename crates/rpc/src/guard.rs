//! Origin and credential checks run before any handler.

use crate::error::ApiError;
use crate::server::SharedState;
use arbor_network::AuthConfig;
use arbor_types::{normalize_ip, parse_ip, NodeError};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

/// The resolved client address, available to handlers as an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// The socket peer, or the first `x-forwarded-for` hop when the peer is a
/// trusted proxy.
pub fn client_ip(peer: IpAddr, headers: &HeaderMap, trusted_proxies: &[IpAddr]) -> IpAddr {
    let peer = normalize_ip(peer);
    if !trusted_proxies
        .iter()
        .any(|proxy| normalize_ip(*proxy) == peer)
    {
        return peer;
    }
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| parse_ip(value.trim()))
        .map(normalize_ip)
        .unwrap_or(peer)
}

pub(crate) async fn guard_origin(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let ip = client_ip(
        peer.ip(),
        request.headers(),
        &state.node.config().network.trusted_proxies,
    );
    if let Err(err) = state.node.behavior().check_origin(ip) {
        debug!("Refused {} {} from {}", request.method(), request.uri().path(), ip);
        return Err(err.into());
    }
    request.extensions_mut().insert(ClientIp(ip));
    Ok(next.run(request).await)
}

pub(crate) async fn require_auth(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(auth) = &state.node.config().network.auth {
        if !is_authorized(request.headers(), auth) {
            return Err(NodeError::Auth("invalid credentials".to_string()).into());
        }
    }
    Ok(next.run(request).await)
}

fn is_authorized(headers: &HeaderMap, auth: &AuthConfig) -> bool {
    let Some(encoded) = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
    else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    credentials
        .split_once(':')
        .is_some_and(|(username, password)| username == auth.username && password == auth.password)
}
