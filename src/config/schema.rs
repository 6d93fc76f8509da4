//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::codec::Protocol;

/// Root configuration for the edge proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Downstream listeners.
    pub listeners: Vec<ListenerConfig>,

    /// Upstream clusters.
    pub clusters: Vec<ClusterConfig>,

    /// Route definitions mapping requests to clusters.
    pub routes: Vec<RouteConfig>,

    /// Graceful shutdown settings.
    pub drain: DrainConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Listener identifier for logging.
    pub name: String,

    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Wire protocol spoken by downstream clients.
    pub protocol: Protocol,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Per-connection buffered byte high watermark.
    pub buffer_limit_bytes: usize,

    /// Ceiling for a request's start line plus header block.
    pub max_request_headers_bytes: usize,

    /// Accept `GET http://host/path` style request targets.
    pub allow_absolute_url: bool,

    /// Accept HTTP/1.0 requests instead of answering 426.
    pub accept_http_10: bool,

    /// Authority assumed for HTTP/1.0 requests without `Host`.
    pub default_host_for_http_10: Option<String>,

    /// HTTP/2 SETTINGS_MAX_CONCURRENT_STREAMS.
    pub max_concurrent_streams: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            bind_address: "0.0.0.0:8080".to_string(),
            protocol: Protocol::Http1,
            max_connections: 10_000,
            buffer_limit_bytes: 1024 * 1024,
            max_request_headers_bytes: 60 * 1024,
            allow_absolute_url: false,
            accept_http_10: false,
            default_host_for_http_10: None,
            max_concurrent_streams: 100,
        }
    }
}

/// Upstream cluster configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Unique cluster identifier referenced by routes.
    pub name: String,

    /// Wire protocol spoken to the hosts.
    pub protocol: Protocol,

    /// Host addresses (e.g., "127.0.0.1:3000").
    pub hosts: Vec<String>,

    /// Connection ceiling per host.
    pub max_connections_per_host: usize,

    /// Concurrent streams per HTTP/2 connection.
    pub max_streams_per_connection: usize,

    /// Connect timeout in milliseconds; also bounds waiting for a free slot.
    pub connect_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            protocol: Protocol::Http1,
            hosts: Vec::new(),
            max_connections_per_host: 1024,
            max_streams_per_connection: 100,
            connect_timeout_ms: 5000,
        }
    }
}

/// Route configuration mapping requests to a cluster.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host to match (exact, case-insensitive); `*` matches any.
    pub host: Option<String>,

    /// Path prefix to match.
    pub path_prefix: Option<String>,

    /// Cluster name to forward to.
    pub cluster: String,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,

    /// Reject requests without an authority with 400.
    #[serde(default)]
    pub require_host: bool,

    /// Let CONNECT requests open tunnels through this route.
    #[serde(default)]
    pub allow_connect: bool,

    /// Answer with a `301` to the `https` form of the request URL.
    #[serde(default)]
    pub https_redirect: bool,

    /// Retry policy; a single retry on connect failure when absent.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Trigger categories: 5xx, gateway-error, connect-failure, reset,
    /// refused-stream, retriable-4xx.
    pub retry_on: Vec<String>,

    /// gRPC status names that trigger a retry.
    pub retry_grpc_on: Vec<String>,

    /// Retries after the first attempt.
    pub num_retries: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_on: vec!["connect-failure".to_string()],
            retry_grpc_on: Vec::new(),
            num_retries: 1,
            base_delay_ms: 25,
            max_delay_ms: 250,
        }
    }
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DrainConfig {
    /// How long to wait for connections after draining starts.
    pub timeout_secs: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}
