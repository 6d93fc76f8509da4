//! Cluster management.
//!
//! # Responsibilities
//! - Build hosts and their pools from cluster configuration
//! - Select a host per attempt through the cluster's load balancer
//! - Fan drain requests out to every pool

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::upstream::host::{Host, HostGuard};
use crate::upstream::pool::{ConnectionPool, PoolSettings};
use crate::upstream::round_robin::RoundRobin;
use crate::upstream::{Connector, LoadBalancer, UpstreamError, UpstreamStream};

/// A named set of interchangeable hosts.
#[derive(Debug)]
pub struct Cluster {
    name: String,
    hosts: Vec<Arc<Host>>,
    lb: Box<dyn LoadBalancer>,
}

impl Cluster {
    pub fn new(config: &ClusterConfig, connector: Arc<dyn Connector>) -> Self {
        let settings = PoolSettings::from_cluster(config);
        let mut hosts = Vec::with_capacity(config.hosts.len());
        for address in &config.hosts {
            match address.parse() {
                Ok(addr) => {
                    let pool = ConnectionPool::new(&config.name, addr, settings.clone(), connector.clone());
                    hosts.push(Arc::new(Host::new(addr, pool)));
                }
                Err(_) => warn!(cluster = %config.name, address = %address, "Invalid host address"),
            }
        }
        Self {
            name: config.name.clone(),
            hosts,
            lb: Box::new(RoundRobin::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    /// Pick the host for the next attempt.
    pub fn select_host(&self) -> Option<HostGuard> {
        let host = self.lb.next_host(&self.hosts);
        if host.is_none() {
            debug!(cluster = %self.name, "No hosts in cluster");
        }
        host.map(|h| h.begin_exchange())
    }

    /// Pick a host and obtain a stream to it.
    pub async fn acquire(&self) -> Result<(UpstreamStream, HostGuard), UpstreamError> {
        let host = self
            .select_host()
            .ok_or_else(|| UpstreamError::NoHost(self.name.clone()))?;
        let stream = host.pool.acquire().await?;
        Ok((stream, host))
    }

    pub fn drain_connections(&self) {
        for host in &self.hosts {
            host.pool.drain_connections();
        }
    }
}

/// Owns every configured cluster.
#[derive(Debug)]
pub struct ClusterManager {
    clusters: HashMap<String, Arc<Cluster>>,
    connector: Arc<dyn Connector>,
}

impl ClusterManager {
    pub fn new(configs: &[ClusterConfig], connector: Arc<dyn Connector>) -> Self {
        let clusters = configs
            .iter()
            .map(|config| {
                (
                    config.name.clone(),
                    Arc::new(Cluster::new(config, connector.clone())),
                )
            })
            .collect();
        Self { clusters, connector }
    }

    pub fn get(&self, name: &str) -> Result<Arc<Cluster>, UpstreamError> {
        self.clusters
            .get(name)
            .cloned()
            .ok_or_else(|| UpstreamError::UnknownCluster(name.to_string()))
    }

    /// Transport used for upstream connections and tunnels.
    pub fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }

    pub fn drain_connections(&self) {
        for cluster in self.clusters.values() {
            cluster.drain_connections();
        }
    }
}
