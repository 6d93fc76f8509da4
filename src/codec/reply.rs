//! Locally synthesized responses.

use bytes::Bytes;
use http::{header, HeaderValue, StatusCode};

use super::{ProtocolError, ResponseHead};

/// Body of the reply sent when no upstream attempt produced response headers.
pub const UPSTREAM_UNAVAILABLE_BODY: &str =
    "upstream connect error or disconnect/reset before headers";

/// A response generated by the proxy itself rather than an upstream.
#[derive(Debug, Clone)]
pub struct LocalReply {
    pub status: StatusCode,
    pub content_type: Option<&'static str>,
    pub body: Bytes,
    /// `location` of a redirect.
    pub location: Option<HeaderValue>,
    /// Close the downstream connection after writing.
    pub close: bool,
}

impl LocalReply {
    pub fn bad_request() -> Self {
        Self::closing(StatusCode::BAD_REQUEST)
    }

    /// The fixed reply for a codec failure.
    pub fn from_protocol_error(err: &ProtocolError) -> Self {
        Self::closing(err.status())
    }

    pub fn upstream_unavailable() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            content_type: Some("text/plain"),
            body: Bytes::from_static(UPSTREAM_UNAVAILABLE_BODY.as_bytes()),
            location: None,
            close: false,
        }
    }

    /// `301` pointing the client at `location`.
    pub fn redirect(location: HeaderValue) -> Self {
        Self {
            status: StatusCode::MOVED_PERMANENTLY,
            content_type: None,
            body: Bytes::new(),
            location: Some(location),
            close: false,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            content_type: None,
            body: Bytes::new(),
            location: None,
            close: false,
        }
    }

    /// Same reply, but the connection ends after it.
    pub fn close_after(mut self) -> Self {
        self.close = true;
        self
    }

    fn closing(status: StatusCode) -> Self {
        Self {
            status,
            content_type: None,
            body: Bytes::new(),
            location: None,
            close: true,
        }
    }

    /// Response head carrying `content-length` and, if set, `content-type`.
    ///
    /// `connection: close` is left to the HTTP/1 encoder.
    pub fn head(&self) -> ResponseHead {
        let mut head = ResponseHead::new(self.status);
        head.headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        if let Some(ct) = self.content_type {
            head.headers
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(ct));
        }
        if let Some(location) = &self.location {
            head.headers.insert(header::LOCATION, location.clone());
        }
        head
    }
}
