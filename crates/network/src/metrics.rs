//! Topology gauges and counters, exported by the node binary when enabled.

use metrics::{counter, describe_counter, describe_gauge, gauge};

pub const NETWORK_SIZE: &str = "arbor_network_size";
pub const SLAVES: &str = "arbor_slaves";
pub const MASTERS: &str = "arbor_masters";
pub const REGISTRATIONS_TOTAL: &str = "arbor_registrations_total";
pub const PEER_FAILURES_TOTAL: &str = "arbor_peer_failures_total";
pub const BANS_TOTAL: &str = "arbor_bans_total";

/// Register descriptions with the installed recorder.
pub fn describe() {
    describe_gauge!(NETWORK_SIZE, "Estimated number of nodes in the network");
    describe_gauge!(SLAVES, "Slaves registered with this node");
    describe_gauge!(MASTERS, "Masters known to this node");
    describe_counter!(REGISTRATIONS_TOTAL, "Successful registrations with a master");
    describe_counter!(PEER_FAILURES_TOTAL, "Failed requests to peers");
    describe_counter!(BANS_TOTAL, "Addresses banned by this node");
}

pub fn record_structure(network_size: u64, slaves: u64, masters: u64) {
    gauge!(NETWORK_SIZE).set(network_size as f64);
    gauge!(SLAVES).set(slaves as f64);
    gauge!(MASTERS).set(masters as f64);
}

pub fn record_registration() {
    counter!(REGISTRATIONS_TOTAL).increment(1);
}

pub fn record_peer_failure() {
    counter!(PEER_FAILURES_TOTAL).increment(1);
}
