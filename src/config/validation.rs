//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference existing clusters)
//! - Validate value ranges (limits > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{ClusterConfig, ListenerConfig, ProxyConfig, RouteConfig};
use crate::resilience::retries::{GrpcCode, RetryOn};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for (i, listener) in config.listeners.iter().enumerate() {
        validate_listener(&format!("listeners[{i}]"), listener, &mut errors);
    }

    let mut cluster_names = HashSet::new();
    for (i, cluster) in config.clusters.iter().enumerate() {
        let field = format!("clusters[{i}]");
        if !cluster_names.insert(cluster.name.as_str()) {
            errors.push(ValidationError::new(
                &field,
                format!("duplicate cluster name '{}'", cluster.name),
            ));
        }
        validate_cluster(&field, cluster, &mut errors);
    }

    for (i, route) in config.routes.iter().enumerate() {
        validate_route(&format!("routes[{i}]"), route, &cluster_names, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_listener(field: &str, listener: &ListenerConfig, errors: &mut Vec<ValidationError>) {
    if listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            format!("{field}.bind_address"),
            format!("'{}' is not a socket address", listener.bind_address),
        ));
    }
    if listener.max_connections == 0 {
        errors.push(ValidationError::new(
            format!("{field}.max_connections"),
            "must be greater than 0",
        ));
    }
    if listener.buffer_limit_bytes == 0 {
        errors.push(ValidationError::new(
            format!("{field}.buffer_limit_bytes"),
            "must be greater than 0",
        ));
    }
    if listener.max_request_headers_bytes == 0 {
        errors.push(ValidationError::new(
            format!("{field}.max_request_headers_bytes"),
            "must be greater than 0",
        ));
    }
    if listener.max_concurrent_streams == 0 {
        errors.push(ValidationError::new(
            format!("{field}.max_concurrent_streams"),
            "must be greater than 0",
        ));
    }
}

fn validate_cluster(field: &str, cluster: &ClusterConfig, errors: &mut Vec<ValidationError>) {
    if cluster.name.is_empty() {
        errors.push(ValidationError::new(format!("{field}.name"), "must not be empty"));
    }
    for host in &cluster.hosts {
        if host.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                format!("{field}.hosts"),
                format!("'{host}' is not a socket address"),
            ));
        }
    }
    if cluster.max_connections_per_host == 0 {
        errors.push(ValidationError::new(
            format!("{field}.max_connections_per_host"),
            "must be greater than 0",
        ));
    }
    if cluster.max_streams_per_connection == 0 {
        errors.push(ValidationError::new(
            format!("{field}.max_streams_per_connection"),
            "must be greater than 0",
        ));
    }
}

fn validate_route(
    field: &str,
    route: &RouteConfig,
    clusters: &HashSet<&str>,
    errors: &mut Vec<ValidationError>,
) {
    if !clusters.contains(route.cluster.as_str()) {
        errors.push(ValidationError::new(
            format!("{field}.cluster"),
            format!("unknown cluster '{}'", route.cluster),
        ));
    }
    if let Some(prefix) = &route.path_prefix {
        if !prefix.starts_with('/') {
            errors.push(ValidationError::new(
                format!("{field}.path_prefix"),
                "must start with '/'",
            ));
        }
    }
    let Some(retry) = &route.retry else {
        return;
    };
    for name in &retry.retry_on {
        if RetryOn::parse(name).is_none() {
            errors.push(ValidationError::new(
                format!("{field}.retry.retry_on"),
                format!("unknown retry condition '{name}'"),
            ));
        }
    }
    for name in &retry.retry_grpc_on {
        if GrpcCode::parse(name).is_none() {
            errors.push(ValidationError::new(
                format!("{field}.retry.retry_grpc_on"),
                format!("unknown gRPC status '{name}'"),
            ));
        }
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        errors.push(ValidationError::new(
            format!("{field}.retry.base_delay_ms"),
            "must not exceed max_delay_ms",
        ));
    }
}
