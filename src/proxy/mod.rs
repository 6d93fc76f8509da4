//! Request forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! Connection manager (http/h1.rs, http/h2.rs)
//!     → Downstream channel: request StreamEvents
//!     → forward.rs (route, acquire upstream, retry loop)
//!         → tunnel.rs for CONNECT
//!     → Downstream channel: Reply (response events or a local reply)
//!     → Connection manager encodes and writes
//! ```
//!
//! # Design Decisions
//! - One router task per downstream stream; it never touches the socket
//! - Channels are bounded so a slow side stops the fast side from reading
//! - The connection manager turns local replies into wire bytes, so both
//!   protocols share one router

pub mod forward;
pub mod state;
pub mod tunnel;

pub use forward::forward;
pub use state::RouterState;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::codec::{LocalReply, RequestHead, ResponseHead, StreamEvent};
use crate::config::ProxyConfig;
use crate::lifecycle::DrainCoordinator;
use crate::routing::RouteTable;
use crate::upstream::{ClusterManager, Connector};

/// Events queued between a connection manager and its router.
const CHANNEL_CAPACITY: usize = 16;

/// Shared state every router consults.
#[derive(Debug)]
pub struct ProxyContext {
    pub routes: RouteTable,
    pub clusters: ClusterManager,
    pub drain: DrainCoordinator,
}

impl ProxyContext {
    pub fn new(config: &ProxyConfig, connector: Arc<dyn Connector>, drain: DrainCoordinator) -> Self {
        Self {
            routes: RouteTable::new(&config.routes),
            clusters: ClusterManager::new(&config.clusters, connector),
            drain,
        }
    }

    /// Enter drain mode and retire upstream connections.
    pub fn start_draining(&self) {
        self.drain.start_draining();
        self.clusters.drain_connections();
    }
}

/// Something for the connection manager to write downstream.
#[derive(Debug)]
pub enum Reply {
    Event(StreamEvent<ResponseHead>),
    Local(LocalReply),
}

/// The router's end of a downstream stream.
#[derive(Debug)]
pub struct Downstream {
    pub requests: mpsc::Receiver<StreamEvent<RequestHead>>,
    pub replies: mpsc::Sender<Reply>,
    /// Bytes of request body kept for replay.
    pub buffer_limit: usize,
}

impl Downstream {
    /// Forward a response event; false once the downstream has gone away.
    pub async fn send(&self, event: StreamEvent<ResponseHead>) -> bool {
        self.replies.send(Reply::Event(event)).await.is_ok()
    }

    pub async fn reply(&self, reply: LocalReply) -> bool {
        self.replies.send(Reply::Local(reply)).await.is_ok()
    }
}

/// The connection manager's end of a downstream stream.
#[derive(Debug)]
pub struct DownstreamHandle {
    pub requests: mpsc::Sender<StreamEvent<RequestHead>>,
    pub replies: mpsc::Receiver<Reply>,
}

pub fn downstream_channel(buffer_limit: usize) -> (DownstreamHandle, Downstream) {
    let (req_tx, req_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (reply_tx, reply_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        DownstreamHandle {
            requests: req_tx,
            replies: reply_rx,
        },
        Downstream {
            requests: req_rx,
            replies: reply_tx,
            buffer_limit,
        },
    )
}
