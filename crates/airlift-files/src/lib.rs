//! # Airlift Files
//!
//! File staging for Airlift transfers.
//!
//! This crate provides:
//! - Fixed-size file chunking with per-chunk BLAKE3 checksums
//! - Receiver-side chunk staging and index-order reassembly
//! - Streaming whole-file checksums
//! - The `Packager` seam for directory payloads

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunker;
pub mod hasher;
pub mod staging;

pub use chunker::{ChunkStore, FileChunker, read_chunk_at};
pub use hasher::{data_checksum, file_checksum};
pub use staging::{Packager, PassthroughPackager, Staging};

/// Transfer chunk size (1 MiB). Every chunk except the last is exactly this
/// size; the last carries the remainder.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Number of chunks needed to carry `size` bytes at `chunk_size`.
#[must_use]
pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size as u64)
}
