//! Outbound splitting and inbound aggregation of chunked messages.

use std::sync::atomic::{AtomicU8, Ordering};

use bytes::{Bytes, BytesMut};
use trellis_core::wire::{ChunkCodec, MessageChunk, WireError, MAX_CHUNKS};

/// Splits payloads that exceed one datagram into chunks.
///
/// Keep one splitter per channel. Message ids are allocated round-robin
/// starting at a random value.
#[derive(Debug)]
pub struct MessageSplitter {
    codec: ChunkCodec,
    budget: usize,
    max_content_length: usize,
    next_msg_id: AtomicU8,
}

impl MessageSplitter {
    pub fn new(codec: ChunkCodec, mtu: usize, max_content_length: usize) -> Result<Self, SplitError> {
        let header = codec.header_len();
        if mtu <= header {
            return Err(SplitError::MtuTooSmall { mtu, header });
        }
        Ok(Self {
            codec,
            budget: mtu - header,
            max_content_length,
            next_msg_id: AtomicU8::new(rand::random()),
        })
    }

    pub fn codec(&self) -> ChunkCodec {
        self.codec
    }

    /// Largest payload carried by a single chunk.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// True if `len` bytes fit in one datagram and need no chunking.
    pub fn fits_unchunked(&self, len: usize) -> bool {
        len <= self.budget
    }

    /// Split `content` into content chunks followed by a last chunk that
    /// declares how many content chunks precede it. The last chunk carries
    /// the final fragment. Payloads are slices of `content`.
    pub fn split(&self, content: Bytes) -> Result<Vec<MessageChunk>, SplitError> {
        if content.len() > self.max_content_length {
            return Err(SplitError::ContentTooLarge {
                length: content.len(),
                max: self.max_content_length,
            });
        }

        let fragments = content.len().div_ceil(self.budget).max(1);
        let content_chunks = fragments - 1;
        if content_chunks > MAX_CHUNKS {
            return Err(SplitError::TooManyChunks(fragments));
        }

        let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        let mut chunks = Vec::with_capacity(fragments);
        for i in 0..content_chunks {
            let start = i * self.budget;
            chunks.push(MessageChunk::content(
                msg_id,
                i as u32,
                content.slice(start..start + self.budget),
            ));
        }
        let tail = content.slice(content_chunks * self.budget..);
        chunks.push(MessageChunk::last(msg_id, content_chunks as u32, tail));
        Ok(chunks)
    }

    /// Split and encode in one go, ready for the transport.
    pub fn split_encoded(&self, content: Bytes) -> Result<Vec<Bytes>, SplitError> {
        let chunks = self.split(content)?;
        let mut out = Vec::with_capacity(chunks.len());
        let mut buf = BytesMut::new();
        for chunk in &chunks {
            self.codec.encode_into(chunk, &mut buf)?;
            out.push(buf.split().freeze());
        }
        Ok(out)
    }
}

/// Concatenate a completed message, content chunks in order then the last
/// chunk, into one payload.
pub fn aggregate(chunks: Vec<MessageChunk>) -> Bytes {
    if let [only] = chunks.as_slice() {
        return only.payload.clone();
    }
    let total: usize = chunks.iter().map(|c| c.payload.len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for chunk in chunks {
        out.extend_from_slice(&chunk.payload);
    }
    out.freeze()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    #[error("message content of {length} bytes exceeds maximum of {max} bytes")]
    ContentTooLarge { length: usize, max: usize },

    #[error("message needs {0} chunks, more than a chunked message can carry")]
    TooManyChunks(usize),

    #[error("mtu {mtu} leaves no room after the {header} byte chunk header")]
    MtuTooSmall { mtu: usize, header: usize },

    #[error(transparent)]
    Wire(#[from] WireError),
}
