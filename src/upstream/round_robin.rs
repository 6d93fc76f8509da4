//! Round-robin host selection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::upstream::{Host, LoadBalancer};

/// Round-robin selector.
/// Stores an internal counter to rotate through hosts, so a retry lands on
/// the next host when the cluster has more than one.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_host(&self, hosts: &[Arc<Host>]) -> Option<Arc<Host>> {
        if hosts.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % hosts.len();
        Some(hosts[index].clone())
    }
}
