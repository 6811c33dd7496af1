//! Chunk reassembly, one in-flight message per channel.
//!
//! Every channel gets its own [`ReassemblyBuffer`]. The first chunk of a
//! message starts an assembly and arms a timeout; chunks for other message
//! ids are dropped until the assembly completes, is discarded, or times out.
//! That bounds memory per channel and makes message-id reuse safe.
//!
//! The buffer owns every chunk it holds. Completion moves the chunks out to
//! the caller in ascending order; discard and timeout drop them. There is no
//! path on which a payload is released twice or kept.
//!
//! The buffer does not run timers itself. Whoever drives it sleeps until
//! [`TimeoutTicket::deadline`] and hands the ticket back through
//! [`ReassemblyBuffer::on_timeout`]. A ticket from an assembly that already
//! finished is recognised by its generation and ignored.

use std::time::Duration;

use tokio::time::Instant;
use trellis_core::wire::{ChunkKind, MessageChunk, MAX_CHUNKS};

/// Handle for the timeout of one assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutTicket {
    generation: u64,
    deadline: Instant,
}

impl TimeoutTicket {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[derive(Debug)]
struct Assembly {
    msg_id: u8,
    length: usize,
    /// Content chunks indexed by chunk number.
    slots: Vec<Option<MessageChunk>>,
    filled: usize,
    last: Option<MessageChunk>,
    deadline: Instant,
}

impl Assembly {
    fn declared_total(&self) -> Option<u32> {
        self.last.as_ref().map(MessageChunk::number)
    }

    fn is_complete(&self) -> bool {
        self.declared_total()
            .is_some_and(|total| total as usize == self.filled)
    }
}

/// Per-channel reassembly state machine.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    max_content_length: usize,
    timeout: Duration,
    generation: u64,
    assembly: Option<Assembly>,
}

impl ReassemblyBuffer {
    pub fn new(max_content_length: usize, timeout: Duration) -> Self {
        Self {
            max_content_length,
            timeout,
            generation: 0,
            assembly: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.assembly.is_none()
    }

    /// Message id of the assembly in progress.
    pub fn current_msg_id(&self) -> Option<u8> {
        self.assembly.as_ref().map(|a| a.msg_id)
    }

    /// Number of chunks currently held, last chunk included.
    pub fn buffered_chunks(&self) -> usize {
        self.assembly
            .as_ref()
            .map(|a| a.filled + usize::from(a.last.is_some()))
            .unwrap_or(0)
    }

    /// Timeout of the assembly in progress, if any.
    pub fn pending_timeout(&self) -> Option<TimeoutTicket> {
        self.assembly.as_ref().map(|a| TimeoutTicket {
            generation: self.generation,
            deadline: a.deadline,
        })
    }

    /// Feed one chunk. Returns the complete message (content chunks in
    /// ascending order, then the last chunk) or an empty vec while
    /// chunks are still missing. On error the assembly has been discarded.
    pub fn on_chunk(&mut self, chunk: MessageChunk) -> Result<Vec<MessageChunk>, ReassemblyError> {
        let timeout = self.timeout;
        if self.assembly.is_none() {
            self.generation = self.generation.wrapping_add(1);
        }
        let assembly = self.assembly.get_or_insert_with(|| Assembly {
            msg_id: chunk.msg_id,
            length: 0,
            slots: Vec::new(),
            filled: 0,
            last: None,
            deadline: Instant::now() + timeout,
        });

        if chunk.msg_id != assembly.msg_id {
            tracing::trace!(
                msg_id = chunk.msg_id,
                current = assembly.msg_id,
                "chunk for another message while one is in flight, dropping"
            );
            return Ok(Vec::new());
        }

        assembly.length += chunk.payload.len();
        if assembly.length > self.max_content_length {
            let length = assembly.length;
            self.discard();
            return Err(ReassemblyError::ContentTooLarge {
                length,
                max: self.max_content_length,
            });
        }

        match chunk.kind {
            ChunkKind::Last { total_chunks } => {
                if assembly.last.is_some() {
                    tracing::trace!(msg_id = chunk.msg_id, "duplicate last chunk, dropping");
                } else if assembly.slots.len() > total_chunks as usize {
                    // slots only grow to fit the highest chunk number seen
                    let chunk_no = (assembly.slots.len() - 1) as u32;
                    self.discard();
                    return Err(ReassemblyError::MoreChunksThanDeclared {
                        declared: total_chunks,
                        chunk_no,
                    });
                } else {
                    assembly.last = Some(chunk);
                }
            }
            ChunkKind::Content { chunk_no } => {
                let index = chunk_no as usize;
                if index >= MAX_CHUNKS {
                    self.discard();
                    return Err(ReassemblyError::ChunkOutOfRange(chunk_no));
                }
                if let Some(declared) = assembly.declared_total() {
                    if chunk_no >= declared {
                        self.discard();
                        return Err(ReassemblyError::MoreChunksThanDeclared { declared, chunk_no });
                    }
                }
                if assembly.slots.len() <= index {
                    assembly.slots.resize_with(index + 1, || None);
                }
                if assembly.slots[index].replace(chunk).is_none() {
                    assembly.filled += 1;
                }
            }
        }

        if !assembly.is_complete() {
            return Ok(Vec::new());
        }

        let Some(done) = self.assembly.take() else {
            return Ok(Vec::new());
        };
        tracing::trace!(msg_id = done.msg_id, chunks = done.filled, length = done.length, "message reassembled");
        let mut out: Vec<MessageChunk> = done.slots.into_iter().flatten().collect();
        out.extend(done.last);
        Ok(out)
    }

    /// Handle a fired timer. Discards the assembly the ticket belongs to and
    /// returns true; a ticket for an assembly that is already gone is a no-op.
    pub fn on_timeout(&mut self, ticket: TimeoutTicket) -> bool {
        match &self.assembly {
            Some(a) if ticket.generation == self.generation => {
                tracing::debug!(
                    msg_id = a.msg_id,
                    present = a.filled + usize::from(a.last.is_some()),
                    declared = ?a.declared_total(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "not all chunks received in time, message dropped"
                );
                self.assembly = None;
                true
            }
            _ => false,
        }
    }

    /// Drop the assembly in progress and everything it holds.
    pub fn discard(&mut self) {
        if let Some(a) = self.assembly.take() {
            tracing::debug!(msg_id = a.msg_id, chunks = a.filled, "assembly discarded");
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Protocol violations detected while reassembling. The offending assembly
/// has already been discarded; closing the channel is the caller's call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("message content of {length} bytes exceeds maximum of {max} bytes")]
    ContentTooLarge { length: usize, max: usize },

    #[error("chunk number {chunk_no} lies beyond the {declared} chunks the last chunk declares")]
    MoreChunksThanDeclared { declared: u32, chunk_no: u32 },

    #[error("chunk number {0} is beyond the {} slot limit", MAX_CHUNKS)]
    ChunkOutOfRange(u32),
}
