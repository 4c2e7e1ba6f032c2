//! HTTP surface of an arbor node.
//!
//! Client routes live under `/client`, node-to-node routes under
//! `/api/node`. Every request passes the origin guard; `/status` and the
//! node routes also require the configured credentials.

pub mod error;
pub mod guard;
pub mod server;

pub use error::ApiError;
pub use guard::{client_ip, ClientIp};
pub use server::{bind_listener, build_router, serve, AppState};
