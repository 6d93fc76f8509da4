//! Process-wide drain state.

use std::sync::Arc;

use tokio::sync::watch;

use crate::observability::metrics;

/// Handle over the shared `draining` flag.
///
/// Connections subscribe and react on the transition: HTTP/1 responses stop
/// offering keep-alive, HTTP/2 connections send GOAWAY, and pooled upstream
/// connections stop taking new streams.
#[derive(Debug, Clone)]
pub struct DrainCoordinator {
    tx: Arc<watch::Sender<bool>>,
}

impl DrainCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn start_draining(&self) {
        if self.tx.send_replace(true) {
            return;
        }
        metrics::record_drain_transition();
        tracing::info!("Draining started");
    }

    pub fn stop_draining(&self) {
        if !self.tx.send_replace(false) {
            return;
        }
        metrics::record_drain_transition();
        tracing::info!("Draining stopped");
    }

    pub fn is_draining(&self) -> bool {
        *self.tx.borrow()
    }

    /// Receiver that observes every later transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for DrainCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
