//! Stream lifecycle subsystem.
//!
//! # Data Flow
//! ```text
//! Codec events (one connection)
//!     → StreamManager::push_* (validate ordering, account buffered bytes)
//!     → Stream pending queue
//!     → StreamManager::pop (hand events to the router, release bytes)
//!
//! Connection close / reset
//!     → StreamManager::remove + Stream::reset (drop buffers, count the reset)
//! ```
//!
//! # Design Decisions
//! - Streams live in an arena keyed by protocol stream id; nothing holds a
//!   pointer back to its connection
//! - Buffered bytes are tracked per connection; above the limit the owner
//!   stops reading the socket instead of dropping data
//! - Completion and reset are counted exactly once per stream

mod buffer;
mod state;

pub use buffer::BodyBuffer;
pub use state::{Half, Stream, StreamState};

use std::collections::BTreeMap;

use thiserror::Error;

use crate::codec::{ProtocolError, ResetReason, StreamEvent, StreamId};

/// Misuse of a stream that the peer caused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("stream {0} already exists")]
    DuplicateStream(StreamId),

    #[error("stream {0} received headers twice")]
    DuplicateHeaders(StreamId),

    #[error("stream {0} received data before headers")]
    DataBeforeHeaders(StreamId),

    #[error("stream {0} received frames after end of stream")]
    AfterEndStream(StreamId),
}

impl From<StreamError> for ProtocolError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::AfterEndStream(_) => ProtocolError::AfterEndStream,
            _ => ProtocolError::Malformed("stream sequencing"),
        }
    }
}

/// Owner of every stream on one connection.
#[derive(Debug)]
pub struct StreamManager<H> {
    streams: BTreeMap<StreamId, Stream<H>>,
    buffer_limit: usize,
    buffered: usize,
}

impl<H> StreamManager<H> {
    pub fn new(buffer_limit: usize) -> Self {
        Self {
            streams: BTreeMap::new(),
            buffer_limit,
            buffered: 0,
        }
    }

    pub fn begin_stream(&mut self, id: StreamId) -> Result<(), StreamError> {
        if self.streams.contains_key(&id) {
            return Err(StreamError::DuplicateStream(id));
        }
        self.streams.insert(id, Stream::new(id));
        Ok(())
    }

    pub fn push_headers(&mut self, id: StreamId, head: H, end_stream: bool) -> Result<(), StreamError> {
        self.get_mut(id)?.push_headers(head, end_stream)
    }

    pub fn push_data(
        &mut self,
        id: StreamId,
        bytes: bytes::Bytes,
        end_stream: bool,
    ) -> Result<(), StreamError> {
        let len = bytes.len();
        self.get_mut(id)?.push_data(bytes, end_stream)?;
        self.buffered += len;
        Ok(())
    }

    pub fn push_trailers(&mut self, id: StreamId, trailers: http::HeaderMap) -> Result<(), StreamError> {
        self.get_mut(id)?.push_trailers(trailers)
    }

    /// Push any decoded event.
    pub fn push(&mut self, id: StreamId, event: StreamEvent<H>) -> Result<(), StreamError> {
        match event {
            StreamEvent::Headers { head, end_stream } => self.push_headers(id, head, end_stream),
            StreamEvent::Data { bytes, end_stream } => self.push_data(id, bytes, end_stream),
            StreamEvent::Trailers(trailers) => self.push_trailers(id, trailers),
            StreamEvent::Reset(reason) => self.reset(id, reason),
        }
    }

    /// Terminate a stream, discarding its buffered body.
    ///
    /// The consumer still receives a single `Reset` event.
    pub fn reset(&mut self, id: StreamId, reason: ResetReason) -> Result<(), StreamError> {
        let stream = self.get_mut(id)?;
        let freed = stream.reset(reason);
        self.buffered = self.buffered.saturating_sub(freed);
        Ok(())
    }

    pub fn is_half_closed(&self, id: StreamId, half: Half) -> Result<bool, StreamError> {
        Ok(self.get(id)?.is_half_closed(half))
    }

    /// Record that the response direction has ended.
    pub fn end_response(&mut self, id: StreamId) -> Result<(), StreamError> {
        self.get_mut(id)?.end_response();
        Ok(())
    }

    /// Next event waiting for the consumer of `id`.
    pub fn pop(&mut self, id: StreamId) -> Option<StreamEvent<H>> {
        let stream = self.streams.get_mut(&id)?;
        let event = stream.pop()?;
        if let StreamEvent::Data { bytes, .. } = &event {
            self.buffered = self.buffered.saturating_sub(bytes.len());
        }
        Some(event)
    }

    pub fn has_pending(&self, id: StreamId) -> bool {
        self.streams.get(&id).is_some_and(|s| s.has_pending())
    }

    /// False once buffered body bytes reach the connection limit.
    pub fn should_read(&self) -> bool {
        self.buffered < self.buffer_limit
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    /// Take a stream out of the arena, releasing whatever it still buffers.
    pub fn remove(&mut self, id: StreamId) -> Option<Stream<H>> {
        let stream = self.streams.remove(&id)?;
        self.buffered = self.buffered.saturating_sub(stream.pending_bytes());
        Some(stream)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    fn get(&self, id: StreamId) -> Result<&Stream<H>, StreamError> {
        self.streams.get(&id).ok_or(StreamError::UnknownStream(id))
    }

    fn get_mut(&mut self, id: StreamId) -> Result<&mut Stream<H>, StreamError> {
        self.streams.get_mut(&id).ok_or(StreamError::UnknownStream(id))
    }
}
