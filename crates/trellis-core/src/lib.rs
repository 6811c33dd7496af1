//! Shared types, wire format, and configuration for Trellis.
//! All other Trellis crates depend on this one.

pub mod config;
pub mod identity;
pub mod wire;

pub use identity::PeerId;
pub use wire::{ChunkCodec, ChunkKind, Decoded, MessageChunk, WireError};
