//! Per-stream state.

use std::collections::VecDeque;

use bytes::Bytes;
use http::HeaderMap;

use crate::codec::{ResetReason, StreamEvent, StreamId};
use crate::observability::metrics;

use super::StreamError;

/// One direction of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    /// Downstream towards upstream.
    Request,
    /// Upstream towards downstream.
    Response,
}

/// Terminal state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    InFlight,
    Complete,
    Reset(ResetReason),
}

/// A single request/response exchange on a connection.
///
/// Holds inbound events until the consumer takes them and enforces the
/// headers → data* → trailers? ordering.
#[derive(Debug)]
pub struct Stream<H> {
    id: StreamId,
    headers_seen: bool,
    request_end: bool,
    response_end: bool,
    pending: VecDeque<StreamEvent<H>>,
    pending_bytes: usize,
    trailers: Option<HeaderMap>,
    state: StreamState,
}

impl<H> Stream<H> {
    pub fn new(id: StreamId) -> Self {
        Self {
            id,
            headers_seen: false,
            request_end: false,
            response_end: false,
            pending: VecDeque::new(),
            pending_bytes: 0,
            trailers: None,
            state: StreamState::InFlight,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state != StreamState::InFlight
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Trailers seen on the inbound direction, if any.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    pub fn is_half_closed(&self, half: Half) -> bool {
        match half {
            Half::Request => self.request_end,
            Half::Response => self.response_end,
        }
    }

    pub fn push_headers(&mut self, head: H, end_stream: bool) -> Result<(), StreamError> {
        self.check_open()?;
        if self.headers_seen {
            return Err(StreamError::DuplicateHeaders(self.id));
        }
        self.headers_seen = true;
        self.request_end = end_stream;
        self.pending.push_back(StreamEvent::Headers { head, end_stream });
        Ok(())
    }

    pub fn push_data(&mut self, bytes: Bytes, end_stream: bool) -> Result<(), StreamError> {
        self.check_open()?;
        if !self.headers_seen {
            return Err(StreamError::DataBeforeHeaders(self.id));
        }
        self.request_end = end_stream;
        self.pending_bytes += bytes.len();
        self.pending.push_back(StreamEvent::Data { bytes, end_stream });
        Ok(())
    }

    pub fn push_trailers(&mut self, trailers: HeaderMap) -> Result<(), StreamError> {
        self.check_open()?;
        if !self.headers_seen {
            return Err(StreamError::DataBeforeHeaders(self.id));
        }
        self.request_end = true;
        self.trailers = Some(trailers.clone());
        self.pending.push_back(StreamEvent::Trailers(trailers));
        Ok(())
    }

    /// Drop buffered events and queue a single reset notification.
    ///
    /// Returns the number of body bytes released. Resetting a terminal
    /// stream is a no-op.
    pub fn reset(&mut self, reason: ResetReason) -> usize {
        if self.is_terminal() {
            return 0;
        }
        let freed = self.pending_bytes;
        self.pending.clear();
        self.pending_bytes = 0;
        self.pending.push_back(StreamEvent::Reset(reason));
        self.state = StreamState::Reset(reason);
        metrics::record_stream_reset(reason);
        tracing::debug!(stream_id = self.id, %reason, "Stream reset");
        freed
    }

    pub fn end_response(&mut self) {
        self.response_end = true;
        self.maybe_complete();
    }

    pub fn pop(&mut self) -> Option<StreamEvent<H>> {
        let event = self.pending.pop_front()?;
        if let StreamEvent::Data { bytes, .. } = &event {
            self.pending_bytes = self.pending_bytes.saturating_sub(bytes.len());
        }
        self.maybe_complete();
        Some(event)
    }

    fn check_open(&self) -> Result<(), StreamError> {
        if self.request_end || self.is_terminal() {
            return Err(StreamError::AfterEndStream(self.id));
        }
        Ok(())
    }

    fn maybe_complete(&mut self) {
        if self.state == StreamState::InFlight
            && self.request_end
            && self.response_end
            && self.pending.is_empty()
        {
            self.state = StreamState::Complete;
            metrics::record_stream_complete();
            tracing::trace!(stream_id = self.id, "Stream complete");
        }
    }
}
