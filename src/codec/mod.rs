//! Wire codec subsystem.
//!
//! # Data Flow
//! ```text
//! socket bytes
//!     → http1.rs (sans-io request/response parser, chunked/length framing)
//!     → http2.rs (adapters over the h2 crate's per-stream handles)
//!     → StreamEvent<RequestHead | ResponseHead>
//!     → stream manager / router
//!
//! Router output
//!     → StreamEvent<ResponseHead>
//!     → codec encode
//!     → socket bytes
//! ```
//!
//! # Design Decisions
//! - Upper layers only ever see `StreamEvent`; wire version is invisible to them
//! - Event order per stream: headers → data* → trailers? → end; reset may cut in anywhere
//! - Malformed input is a `ProtocolError`, mapped to a fixed local reply
//! - framing.rs holds header rules shared by both protocol families

pub mod framing;
pub mod http1;
pub mod http2;
pub mod reply;

use std::fmt;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use reply::LocalReply;

/// Protocol-assigned stream identifier, unique per connection.
pub type StreamId = u32;

/// Wire protocol family spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP/1.x, one stream at a time.
    #[default]
    Http1,
    /// HTTP/2, multiplexed streams.
    Http2,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http1 => f.write_str("http1"),
            Protocol::Http2 => f.write_str("http2"),
        }
    }
}

/// Request start line and headers, normalized across wire protocols.
///
/// `authority` and `path` are the routing input: origin-form, absolute-form
/// and HTTP/2 pseudo-headers all end up here.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: String,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Build a head from its parts with no scheme.
    pub fn new(method: Method, authority: Option<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            scheme: None,
            authority,
            path: path.into(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    /// True for tunnel establishment requests.
    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }
}

/// Response status and headers.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }
}

/// Why a stream was terminated before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetReason {
    /// The transport could not be established.
    ConnectionFailure,
    /// The transport closed underneath the stream.
    ConnectionTermination,
    /// This side abandoned the stream.
    LocalReset,
    /// The peer reset the stream.
    RemoteReset,
    /// The peer refused the stream before processing it.
    RefusedStream,
    /// The peer violated the wire protocol.
    ProtocolError,
    /// A resource limit was hit.
    Overflow,
}

impl ResetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetReason::ConnectionFailure => "connection_failure",
            ResetReason::ConnectionTermination => "connection_termination",
            ResetReason::LocalReset => "local_reset",
            ResetReason::RemoteReset => "remote_reset",
            ResetReason::RefusedStream => "refused_stream",
            ResetReason::ProtocolError => "protocol_error",
            ResetReason::Overflow => "overflow",
        }
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol-independent event on a stream.
#[derive(Debug, Clone)]
pub enum StreamEvent<H> {
    Headers { head: H, end_stream: bool },
    Data { bytes: Bytes, end_stream: bool },
    Trailers(HeaderMap),
    Reset(ResetReason),
}

impl<H> StreamEvent<H> {
    /// True when this event closes its direction of the stream.
    pub fn is_end_stream(&self) -> bool {
        match self {
            StreamEvent::Headers { end_stream, .. } | StreamEvent::Data { end_stream, .. } => {
                *end_stream
            }
            StreamEvent::Trailers(_) => true,
            StreamEvent::Reset(_) => false,
        }
    }
}

/// Malformed or unacceptable wire input.
///
/// Always answered locally and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("invalid content-length")]
    InvalidContentLength,

    #[error("conflicting content-length values")]
    ConflictingContentLength,

    #[error("unsupported transfer-encoding")]
    UnsupportedTransferEncoding,

    #[error("header block exceeds {limit} bytes")]
    HeadersTooLarge { limit: usize },

    #[error("protocol version below minimum")]
    UpgradeRequired,

    #[error("missing host header")]
    MissingHost,

    #[error("invalid chunk framing")]
    InvalidChunk,

    #[error("event after end of stream")]
    AfterEndStream,

    #[error("connection closed mid-message")]
    UnexpectedEof,
}

impl ProtocolError {
    /// Status of the local reply sent for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ProtocolError::HeadersTooLarge { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            ProtocolError::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Stateful translator between a byte stream and stream events.
///
/// `Inbound` is the head type decoded from the peer, `Outbound` the head
/// type encoded towards it.
pub trait Codec {
    type Inbound;
    type Outbound;

    /// Decode the next event from `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Consumed bytes are
    /// removed from `src`.
    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<StreamEvent<Self::Inbound>>, ProtocolError>;

    /// Called once the peer has closed its write side.
    fn decode_eof(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<StreamEvent<Self::Inbound>>, ProtocolError> {
        match self.decode(src)? {
            Some(event) => Ok(Some(event)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::UnexpectedEof),
        }
    }

    /// Encode one outbound event into `dst`.
    fn encode(
        &mut self,
        event: StreamEvent<Self::Outbound>,
        dst: &mut BytesMut,
    ) -> Result<(), ProtocolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_statuses() {
        assert_eq!(
            ProtocolError::HeadersTooLarge { limit: 10 }.status(),
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
        );
        assert_eq!(ProtocolError::UpgradeRequired.status(), StatusCode::UPGRADE_REQUIRED);
        assert_eq!(ProtocolError::ConflictingContentLength.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ProtocolError::Malformed("x").status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn end_stream_flags() {
        let ev: StreamEvent<()> = StreamEvent::Data {
            bytes: Bytes::new(),
            end_stream: true,
        };
        assert!(ev.is_end_stream());
        let ev: StreamEvent<()> = StreamEvent::Trailers(HeaderMap::new());
        assert!(ev.is_end_stream());
        let ev: StreamEvent<()> = StreamEvent::Reset(ResetReason::RemoteReset);
        assert!(!ev.is_end_stream());
    }
}
