//! # Airlift Core
//!
//! The Airlift protocol engine.
//!
//! This crate provides:
//! - The length-prefixed, typed wire protocol and its strict message schemas
//! - The transfer coordinator: sender pipeline, receiver loop, retries,
//!   multi-stream chunk batches, integrity verification
//! - The speed monitor recommending stream-count changes
//! - The typed event bus and the `Node` facade tying discovery, trust and
//!   transfers together

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod error;
pub mod event;
pub mod frame;
pub mod monitor;
pub mod node;
pub mod tls;
pub mod transfer;

use std::time::Duration;

pub use coordinator::{CoordinatorConfig, TransferCoordinator};
pub use error::{Result, TransferError};
pub use event::{Event, EventBus};
pub use monitor::SpeedMonitor;
pub use node::{DiscoveryBackend, Node, NodeConfig};
pub use transfer::{TransferDirection, TransferSnapshot, TransferStatus};

/// TCP port the transfer engine listens on.
pub const TRANSFER_PORT: u16 = 8765;

/// TLS connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout waiting for the peer to accept a transfer request.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout waiting for a single chunk acknowledgement.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts per chunk before the whole transfer fails.
pub const MAX_CHUNK_ATTEMPTS: u32 = 3;

/// Concurrent stream bounds for a batch.
pub const MIN_STREAMS: usize = 1;
/// Upper bound on concurrent streams.
pub const MAX_STREAMS: usize = 8;

/// Initial stream count for a transfer of `size` bytes.
#[must_use]
pub fn initial_stream_count(size: u64) -> usize {
    const MIB: u64 = 1024 * 1024;
    if size < 10 * MIB {
        1
    } else if size < 100 * MIB {
        2
    } else if size < 1024 * MIB {
        4
    } else {
        6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_count_tiers() {
        const MIB: u64 = 1024 * 1024;
        assert_eq!(initial_stream_count(0), 1);
        assert_eq!(initial_stream_count(10 * MIB - 1), 1);
        assert_eq!(initial_stream_count(10 * MIB), 2);
        assert_eq!(initial_stream_count(100 * MIB), 4);
        assert_eq!(initial_stream_count(1024 * MIB), 6);
        assert_eq!(initial_stream_count(u64::MAX), 6);
    }
}
