//! Metrics emitted by the data plane.
//!
//! # Metrics
//! - `edge_proxy_streams_completed_total` (counter)
//! - `edge_proxy_streams_reset_total` (counter): by reset reason
//! - `edge_proxy_retries_total` (counter): by cluster
//! - `edge_proxy_upstream_connect_failures_total` (counter): by cluster
//! - `edge_proxy_local_replies_total` (counter): by status
//! - `edge_proxy_drain_transitions_total` (counter)
//! - `edge_proxy_downstream_connections_active` (gauge)

use crate::codec::ResetReason;

pub const STREAMS_COMPLETED: &str = "edge_proxy_streams_completed_total";
pub const STREAMS_RESET: &str = "edge_proxy_streams_reset_total";
pub const RETRIES: &str = "edge_proxy_retries_total";
pub const UPSTREAM_CONNECT_FAILURES: &str = "edge_proxy_upstream_connect_failures_total";
pub const LOCAL_REPLIES: &str = "edge_proxy_local_replies_total";
pub const DRAIN_TRANSITIONS: &str = "edge_proxy_drain_transitions_total";
pub const DOWNSTREAM_CONNECTIONS_ACTIVE: &str = "edge_proxy_downstream_connections_active";

pub fn record_stream_complete() {
    metrics::counter!(STREAMS_COMPLETED).increment(1);
}

pub fn record_stream_reset(reason: ResetReason) {
    metrics::counter!(STREAMS_RESET, "reason" => reason.as_str()).increment(1);
}

pub fn record_retry(cluster: &str) {
    metrics::counter!(RETRIES, "cluster" => cluster.to_string()).increment(1);
}

pub fn record_connect_failure(cluster: &str) {
    metrics::counter!(UPSTREAM_CONNECT_FAILURES, "cluster" => cluster.to_string()).increment(1);
}

pub fn record_local_reply(status: u16) {
    metrics::counter!(LOCAL_REPLIES, "status" => status.to_string()).increment(1);
}

pub fn record_drain_transition() {
    metrics::counter!(DRAIN_TRANSITIONS).increment(1);
}

pub fn record_downstream_connection_opened() {
    metrics::gauge!(DOWNSTREAM_CONNECTIONS_ACTIVE).increment(1.0);
}

pub fn record_downstream_connection_closed() {
    metrics::gauge!(DOWNSTREAM_CONNECTIONS_ACTIVE).decrement(1.0);
}
