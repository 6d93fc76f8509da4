//! Upstream subsystem.
//!
//! # Data Flow
//! ```text
//! Route matched → cluster identified
//!     → cluster.rs (look up cluster, pick a host)
//!     → round_robin.rs (rotate through hosts)
//!     → pool.rs (reuse an idle/multiplexed connection or open one)
//!     → connector (TCP in production, in-memory in tests)
//!     → client.rs (one request/response exchange on that connection)
//!     → Exchange finished → connection back to pool or closed
//! ```
//!
//! # Design Decisions
//! - One pool per host; HTTP/1 keeps a LIFO idle list, HTTP/2 multiplexes
//! - Pool state sits behind one std mutex that is never held across an await
//! - Transport establishment is a `Connector` capability injected at construction
//! - Connections opened before a drain are closed when released

pub mod client;
pub mod cluster;
pub mod host;
pub mod pool;
pub mod round_robin;

pub use client::UpstreamStream;
pub use cluster::{Cluster, ClusterManager};
pub use host::Host;
pub use pool::{ConnectionPool, PoolSettings};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::codec::{ProtocolError, ResetReason};
use crate::resilience::AttemptFailure;

/// Byte transport to an upstream host.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// Opens transports to upstream hosts.
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedIo>>;
}

/// Plain TCP connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedIo>> {
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedIo)
        })
    }
}

/// Trait for host selection strategies.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    fn next_host(&self, hosts: &[Arc<Host>]) -> Option<Arc<Host>>;
}

/// Failure to obtain or use an upstream stream.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("unknown cluster '{0}'")]
    UnknownCluster(String),

    #[error("no host available in cluster '{0}'")]
    NoHost(String),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("http/2 handshake with {addr} failed: {source}")]
    Handshake {
        addr: SocketAddr,
        #[source]
        source: h2::Error,
    },

    #[error("connection pool for {0} is at capacity")]
    Overflow(SocketAddr),

    #[error("upstream protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("upstream stream reset: {0}")]
    Reset(ResetReason),

    #[error("upstream i/o error: {0}")]
    Io(#[from] io::Error),
}

impl UpstreamError {
    /// How the router should classify this failure.
    pub fn attempt_failure(&self) -> AttemptFailure {
        match self {
            UpstreamError::Overflow(_) => AttemptFailure::Overflow,
            UpstreamError::Reset(reason) => AttemptFailure::Reset(*reason),
            UpstreamError::Protocol(_) => AttemptFailure::Reset(ResetReason::ProtocolError),
            UpstreamError::Io(_) => AttemptFailure::Reset(ResetReason::ConnectionTermination),
            _ => AttemptFailure::ConnectFailure,
        }
    }
}
