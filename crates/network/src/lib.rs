//! Arbor network core
//!
//! - `config`: network, approval, behavior and cache options of a node
//! - `transport`: node-to-node requests and their HTTP implementation
//! - `topology`: slaves, masters, backlink, registration and periodic sync
//! - `node`: the node handle, approval handshake and normalize entry points
//! - `metrics`: topology gauges and counters

pub mod config;
pub mod metrics;
pub mod node;
pub mod topology;
pub mod transport;

pub use config::{AuthConfig, NetworkConfig, NodeConfig};
pub use node::{Node, APPROVAL_INFO_CACHE};
pub use topology::{NodeState, TopologyManager, INTERVIEW_ACTION, REGISTER_ACTION};
pub use transport::{HttpPeerTransport, PeerTransport};
