//! Upstream host abstraction.
//!
//! # Responsibilities
//! - Represent a single upstream host
//! - Own the host's connection pool
//! - Track in-flight exchanges for logging and tests

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::upstream::pool::ConnectionPool;

/// A single upstream host.
#[derive(Debug)]
pub struct Host {
    /// The address of the host.
    pub addr: SocketAddr,
    /// Connections to this host.
    pub pool: ConnectionPool,
    /// Number of exchanges currently using the host.
    in_flight: AtomicUsize,
}

impl Host {
    pub fn new(addr: SocketAddr, pool: ConnectionPool) -> Self {
        Self {
            addr,
            pool,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Get the current number of in-flight exchanges.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Count an exchange against this host until the guard drops.
    pub fn begin_exchange(self: &Arc<Self>) -> HostGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        HostGuard { host: self.clone() }
    }
}

/// A RAII guard that manages the in-flight exchange count.
#[derive(Debug)]
pub struct HostGuard {
    host: Arc<Host>,
}

impl Deref for HostGuard {
    type Target = Host;
    fn deref(&self) -> &Self::Target {
        &self.host
    }
}

impl Drop for HostGuard {
    fn drop(&mut self) {
        self.host.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
