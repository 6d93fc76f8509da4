//! Bounded body buffer.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Ordered body chunks with a byte ceiling.
///
/// A push that would exceed the ceiling is refused and leaves the buffer
/// marked overflowed; nothing already stored is dropped.
#[derive(Debug, Clone)]
pub struct BodyBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
    limit: usize,
    overflowed: bool,
}

impl BodyBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
            limit,
            overflowed: false,
        }
    }

    /// Append a chunk. Returns false if it did not fit.
    pub fn push(&mut self, chunk: Bytes) -> bool {
        if self.overflowed || self.len + chunk.len() > self.limit {
            self.overflowed = true;
            return false;
        }
        self.len += chunk.len();
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.chunks.iter()
    }

    /// All chunks joined into one buffer.
    pub fn to_bytes(&self) -> Bytes {
        if self.chunks.len() == 1 {
            return self.chunks[0].clone();
        }
        let mut out = BytesMut::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}
