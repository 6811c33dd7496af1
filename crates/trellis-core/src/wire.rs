//! Trellis wire format: chunk framing for oversized overlay messages.
//!
//! These constants and layouts ARE the protocol. A chunk on the wire is:
//!
//! ```text
//! [4-byte magic][1-byte msg_id][N-byte chunk number][payload]
//! ```
//!
//! N is 1, 2 or 3 and fixed per deployment. The magic tells content chunks
//! apart from the last chunk of a message; for the last chunk the number
//! field carries the count of content chunks that precede it. Any other
//! leading 4 bytes mean "not a chunk" and the buffer is passed through
//! untouched, so the codec can share a pipeline with unchunked traffic.
//!
//! All multi-byte integers are big-endian. The codec holds no per-channel
//! state and can be shared freely.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Magic Numbers ─────────────────────────────────────────────────────────────

/// Leading magic of a content chunk.
pub const CONTENT_CHUNK_MAGIC: u32 = 0xF770_F7CF;

/// Leading magic of the last chunk of a message.
pub const LAST_CHUNK_MAGIC: u32 = 0xF770_F7D0;

/// Leading magic of an unchunked overlay message.
pub const OVERLAY_MAGIC: u32 = 0x7472_6C73;

/// Length of every magic number on the wire.
pub const MAGIC_LEN: usize = 4;

/// Largest number of content chunks a single message may be split into.
/// Bounds the reassembly buffer's slot storage.
pub const MAX_CHUNKS: usize = 255;

// ── Chunk Prefix ──────────────────────────────────────────────────────────────

/// The fixed-width part of every chunk header.
///
/// The chunk number that follows has a deployment-specific width and is
/// read separately by [`ChunkCodec`].
///
/// Wire size: 5 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkPrefix {
    /// Big-endian magic number, one of the two chunk magics.
    pub magic: [u8; 4],

    /// Identifies the message this chunk belongs to.
    pub msg_id: u8,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(ChunkPrefix, [u8; 5]);

/// Length of [`ChunkPrefix`] on the wire.
pub const PREFIX_LEN: usize = 5;

// ── Chunk Number Width ────────────────────────────────────────────────────────

/// Width of the chunk number field. Fixed per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkNumberWidth {
    One = 1,
    Two = 2,
    Three = 3,
}

impl ChunkNumberWidth {
    /// Field width in bytes.
    pub fn bytes(self) -> usize {
        self as usize
    }

    /// Largest value the field can carry.
    pub fn max_value(self) -> u32 {
        (1u32 << (8 * self.bytes())) - 1
    }
}

impl TryFrom<u8> for ChunkNumberWidth {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ChunkNumberWidth::One),
            2 => Ok(ChunkNumberWidth::Two),
            3 => Ok(ChunkNumberWidth::Three),
            other => Err(WireError::InvalidChunkNumberWidth(other)),
        }
    }
}

impl From<ChunkNumberWidth> for u8 {
    fn from(w: ChunkNumberWidth) -> u8 {
        w as u8
    }
}

// ── Message Chunk ─────────────────────────────────────────────────────────────

/// What the chunk number field means for a given chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// A content chunk at 0-based position `chunk_no`.
    Content { chunk_no: u32 },
    /// The last chunk of a message. `total_chunks` is the number of
    /// content chunks that precede it.
    Last { total_chunks: u32 },
}

/// One bounded-size fragment of an oversized message.
///
/// The payload is a reference-counted slice of the datagram it arrived in.
/// Whoever holds the chunk owns that reference; moving the chunk moves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageChunk {
    pub msg_id: u8,
    pub kind: ChunkKind,
    pub payload: Bytes,
}

impl MessageChunk {
    pub fn content(msg_id: u8, chunk_no: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_id,
            kind: ChunkKind::Content { chunk_no },
            payload: payload.into(),
        }
    }

    pub fn last(msg_id: u8, total_chunks: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_id,
            kind: ChunkKind::Last { total_chunks },
            payload: payload.into(),
        }
    }

    pub fn is_last(&self) -> bool {
        matches!(self.kind, ChunkKind::Last { .. })
    }

    /// The raw value of the chunk number field.
    pub fn number(&self) -> u32 {
        match self.kind {
            ChunkKind::Content { chunk_no } => chunk_no,
            ChunkKind::Last { total_chunks } => total_chunks,
        }
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Result of decoding a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// The buffer was a chunk.
    Chunk(MessageChunk),
    /// The buffer was not a chunk and is handed back unmodified.
    Passthrough(Bytes),
}

/// Stateless chunk encoder/decoder for one chunk-number width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCodec {
    width: ChunkNumberWidth,
}

impl ChunkCodec {
    /// Build a codec for a chunk-number field of `width` bytes.
    /// Any width outside 1..=3 is a configuration error.
    pub fn new(width: u8) -> Result<Self, WireError> {
        Ok(Self {
            width: ChunkNumberWidth::try_from(width)?,
        })
    }

    pub fn with_width(width: ChunkNumberWidth) -> Self {
        Self { width }
    }

    pub fn width(&self) -> ChunkNumberWidth {
        self.width
    }

    /// Fixed header length: magic + msg_id + chunk number.
    pub fn header_len(&self) -> usize {
        PREFIX_LEN + self.width.bytes()
    }

    /// Encode a chunk into a fresh buffer.
    pub fn encode(&self, chunk: &MessageChunk) -> Result<Bytes, WireError> {
        let mut out = BytesMut::with_capacity(self.header_len() + chunk.payload.len());
        self.encode_into(chunk, &mut out)?;
        Ok(out.freeze())
    }

    /// Append the encoding of `chunk` to `dst`. Nothing is written on error.
    pub fn encode_into(&self, chunk: &MessageChunk, dst: &mut BytesMut) -> Result<(), WireError> {
        let (magic, number) = match chunk.kind {
            ChunkKind::Content { chunk_no } => (CONTENT_CHUNK_MAGIC, chunk_no),
            ChunkKind::Last { total_chunks } => (LAST_CHUNK_MAGIC, total_chunks),
        };
        if number > self.width.max_value() {
            return Err(WireError::ChunkNumberOverflow {
                value: number,
                width: self.width.into(),
            });
        }

        let prefix = ChunkPrefix {
            magic: magic.to_be_bytes(),
            msg_id: chunk.msg_id,
        };
        dst.reserve(self.header_len() + chunk.payload.len());
        dst.put_slice(prefix.as_bytes());
        dst.put_uint(u64::from(number), self.width.bytes());
        dst.put_slice(&chunk.payload);
        Ok(())
    }

    /// Decode a buffer. Buffers that are too short or carry a foreign magic
    /// are passed through unmodified. The payload of a decoded chunk is a
    /// slice of `buf`; no bytes are copied.
    pub fn decode(&self, buf: Bytes) -> Decoded {
        let header_len = self.header_len();
        if buf.len() < header_len {
            return Decoded::Passthrough(buf);
        }

        let prefix = match ChunkPrefix::read_from_prefix(&buf[..PREFIX_LEN]) {
            Some(p) => p,
            None => return Decoded::Passthrough(buf),
        };
        let msg_id = prefix.msg_id;
        let number = buf[PREFIX_LEN..header_len]
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));

        let kind = match u32::from_be_bytes(prefix.magic) {
            CONTENT_CHUNK_MAGIC => ChunkKind::Content { chunk_no: number },
            LAST_CHUNK_MAGIC => ChunkKind::Last {
                total_chunks: number,
            },
            _ => return Decoded::Passthrough(buf),
        };

        Decoded::Chunk(MessageChunk {
            msg_id,
            kind,
            payload: buf.slice(header_len..),
        })
    }
}

/// Does `buf` start like something a Trellis node would send?
///
/// True for unchunked overlay messages and for both kinds of chunk.
pub fn is_overlay_frame(buf: &[u8]) -> bool {
    if buf.len() < MAGIC_LEN {
        return false;
    }
    let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    matches!(
        magic,
        OVERLAY_MAGIC | CONTENT_CHUNK_MAGIC | LAST_CHUNK_MAGIC
    )
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when building or writing wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("chunk number width must be 1, 2 or 3 bytes, got {0}")]
    InvalidChunkNumberWidth(u8),

    #[error("chunk number {value} does not fit in {width} byte(s)")]
    ChunkNumberOverflow { value: u32, width: u8 },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
