//! Downstream HTTP subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted TCP connection
//!     → server.rs (listener loop, connection tracking)
//!     → h1.rs (ServerCodec + stream arena, one exchange at a time)
//!       or h2.rs (h2 server connection, one task per stream)
//!     → request.rs (hop-by-hop cleanup, request ID)
//!     → proxy::forward (router task per stream)
//!     → replies encoded back onto the socket
//! ```
//!
//! # Design Decisions
//! - Connection managers own the socket; routers only see channels
//! - Protocol errors become fixed local replies here and never reach a router
//! - Drain state is watched per connection so idle clients are released early

pub mod h1;
pub mod h2;
pub mod request;
pub mod server;

pub use request::X_REQUEST_ID;
pub use server::HttpServer;

use std::io;

use thiserror::Error;

use crate::codec::http1::Http1Settings;
use crate::config::ListenerConfig;
use crate::net::listener::ListenerError;

/// Connection-level failures. Stream-level ones never get this far.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("unknown listener {0}")]
    UnknownListener(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("http/2 error: {0}")]
    Http2(#[from] ::h2::Error),
}

/// Per-connection knobs derived from a listener.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub buffer_limit: usize,
    pub max_request_headers_bytes: usize,
    pub max_concurrent_streams: u32,
    pub http1: Http1Settings,
}

impl ConnectionSettings {
    pub fn from_listener(config: &ListenerConfig) -> Self {
        Self {
            buffer_limit: config.buffer_limit_bytes,
            max_request_headers_bytes: config.max_request_headers_bytes,
            max_concurrent_streams: config.max_concurrent_streams,
            http1: Http1Settings {
                max_header_bytes: config.max_request_headers_bytes,
                allow_absolute_url: config.allow_absolute_url,
                accept_http_10: config.accept_http_10,
                default_host_for_http_10: config.default_host_for_http_10.clone(),
            },
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_listener(&ListenerConfig::default())
    }
}
