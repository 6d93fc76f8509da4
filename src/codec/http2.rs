//! HTTP/2 adapters.
//!
//! Framing, HPACK and flow control come from the `h2` crate. This module
//! converts between its request/response/body handles and `StreamEvent`s so
//! the router never sees protocol-specific types.

use bytes::Bytes;
use h2::{Reason, RecvStream, SendStream};
use http::header::{self, HeaderValue};
use http::{Request, Response, Uri, Version};

use super::framing;
use super::{ProtocolError, RequestHead, ResetReason, ResponseHead, StreamEvent};

/// Normalize an accepted request into routing input.
pub fn request_head(parts: http::request::Parts) -> RequestHead {
    let mut headers = parts.headers;
    let authority = parts
        .uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            headers
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        });
    if let Some(authority) = &authority {
        if let Ok(value) = HeaderValue::from_str(authority) {
            headers.insert(header::HOST, value);
        }
    }
    let path = if parts.method == http::Method::CONNECT {
        String::new()
    } else {
        parts
            .uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string())
    };
    RequestHead {
        method: parts.method,
        scheme: parts.uri.scheme_str().map(str::to_string),
        authority,
        path,
        version: Version::HTTP_2,
        headers,
    }
}

/// Build an outbound request; `fallback_authority` is used when the
/// downstream request carried none.
pub fn build_request(
    mut head: RequestHead,
    fallback_authority: &str,
) -> Result<Request<()>, ProtocolError> {
    framing::strip_hop_by_hop(&mut head.headers);
    framing::merge_cookies(&mut head.headers);
    head.headers.remove(header::HOST);

    let authority = head.authority.as_deref().unwrap_or(fallback_authority);
    let path = if head.path.is_empty() { "/" } else { head.path.as_str() };
    let uri = Uri::builder()
        .scheme(head.scheme.as_deref().unwrap_or("http"))
        .authority(authority)
        .path_and_query(path)
        .build()
        .map_err(|_| ProtocolError::Malformed("request target"))?;

    let mut request = Request::builder()
        .method(head.method)
        .uri(uri)
        .version(Version::HTTP_2)
        .body(())
        .map_err(|_| ProtocolError::Malformed("request"))?;
    *request.headers_mut() = head.headers;
    Ok(request)
}

pub fn response_head(parts: http::response::Parts) -> ResponseHead {
    ResponseHead {
        status: parts.status,
        headers: parts.headers,
    }
}

/// Build an outbound response, dropping fields HTTP/2 forbids.
pub fn build_response(mut head: ResponseHead) -> Response<()> {
    framing::strip_hop_by_hop(&mut head.headers);
    let mut response = Response::new(());
    *response.status_mut() = head.status;
    *response.version_mut() = Version::HTTP_2;
    *response.headers_mut() = head.headers;
    response
}

/// Classify an `h2` failure as seen by the side that observed it.
pub fn reset_reason(err: &h2::Error) -> ResetReason {
    if err.is_io() || err.is_go_away() {
        return ResetReason::ConnectionTermination;
    }
    match err.reason() {
        Some(Reason::REFUSED_STREAM) => ResetReason::RefusedStream,
        Some(_) if err.is_reset() && err.is_remote() => ResetReason::RemoteReset,
        Some(Reason::PROTOCOL_ERROR) => ResetReason::ProtocolError,
        Some(_) if err.is_reset() => ResetReason::LocalReset,
        _ => ResetReason::ProtocolError,
    }
}

/// Wire reason code used when resetting a stream for `reason`.
pub fn h2_reason(reason: ResetReason) -> Reason {
    match reason {
        ResetReason::ProtocolError => Reason::PROTOCOL_ERROR,
        ResetReason::RefusedStream => Reason::REFUSED_STREAM,
        ResetReason::Overflow => Reason::FLOW_CONTROL_ERROR,
        ResetReason::ConnectionFailure => Reason::CONNECT_ERROR,
        ResetReason::LocalReset | ResetReason::RemoteReset | ResetReason::ConnectionTermination => {
            Reason::CANCEL
        }
    }
}

/// Send a body chunk, waiting for peer flow-control capacity.
pub async fn send_data(
    sink: &mut SendStream<Bytes>,
    mut data: Bytes,
    end_stream: bool,
) -> Result<(), h2::Error> {
    if data.is_empty() {
        return sink.send_data(data, end_stream);
    }
    while !data.is_empty() {
        sink.reserve_capacity(data.len());
        let available = match std::future::poll_fn(|cx| sink.poll_capacity(cx)).await {
            Some(result) => result?,
            None => return Err(h2::Error::from(Reason::STREAM_CLOSED)),
        };
        if available == 0 {
            continue;
        }
        let chunk = data.split_to(available.min(data.len()));
        sink.send_data(chunk, end_stream && data.is_empty())?;
    }
    Ok(())
}

/// Write one event to an `h2` send handle.
///
/// Headers are not accepted here; they go through `send_request` or
/// `send_response` on the owning side.
pub async fn send_event<H>(
    sink: &mut SendStream<Bytes>,
    event: StreamEvent<H>,
) -> Result<(), h2::Error> {
    match event {
        StreamEvent::Headers { .. } => Ok(()),
        StreamEvent::Data { bytes, end_stream } => send_data(sink, bytes, end_stream).await,
        StreamEvent::Trailers(trailers) => sink.send_trailers(trailers),
        StreamEvent::Reset(reason) => {
            sink.send_reset(h2_reason(reason));
            Ok(())
        }
    }
}

/// Reads body events from an `h2` receive handle.
///
/// Flow-control capacity is returned only when the caller calls
/// `release`, so the window tracks what downstream consumers have taken.
#[derive(Debug)]
pub struct RecvBody {
    inner: RecvStream,
    finished: bool,
}

impl RecvBody {
    pub fn new(inner: RecvStream) -> Self {
        Self {
            inner,
            finished: false,
        }
    }

    /// A body that ended with its headers.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn mark_finished(&mut self) {
        self.finished = true;
    }

    /// Next body event, or `None` once the body has ended.
    pub async fn next_event<H>(&mut self) -> Option<StreamEvent<H>> {
        if self.finished {
            return None;
        }
        loop {
            match self.inner.data().await {
                Some(Ok(bytes)) => {
                    let end_stream = self.inner.is_end_stream();
                    if bytes.is_empty() && !end_stream {
                        continue;
                    }
                    self.finished = end_stream;
                    return Some(StreamEvent::Data { bytes, end_stream });
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(StreamEvent::Reset(reset_reason(&e)));
                }
                None => break,
            }
        }
        let trailers = self.inner.trailers().await;
        self.finished = true;
        match trailers {
            Ok(Some(trailers)) => Some(StreamEvent::Trailers(trailers)),
            Ok(None) => Some(StreamEvent::Data {
                bytes: Bytes::new(),
                end_stream: true,
            }),
            Err(e) => Some(StreamEvent::Reset(reset_reason(&e))),
        }
    }

    /// Return `n` bytes of receive window to the peer.
    pub fn release(&mut self, n: usize) {
        if n > 0 {
            let _ = self.inner.flow_control().release_capacity(n);
        }
    }
}
