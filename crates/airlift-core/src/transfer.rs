//! Transfer records and their state machine.
//!
//! Sender lifecycle:
//! `pending -> preparing -> (compressing) -> checksumming -> connecting ->
//! transferring -> (paused) -> {completed | failed | cancelled}`.
//!
//! Receiver lifecycle: `receiving -> {completed | failed}`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

/// Which way the bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// This device is the sender
    Send,
    /// This device is the receiver
    Receive,
}

/// Transfer lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Queued, pipeline not yet started
    Pending,
    /// Staging the artifact
    Preparing,
    /// Packing a directory payload
    Compressing,
    /// Computing the whole-file checksum
    Checksumming,
    /// Opening the TLS connection
    Connecting,
    /// Chunks in flight
    Transferring,
    /// Halted by the operator, resumable
    Paused,
    /// All bytes delivered and verified
    Completed,
    /// Terminal failure
    Failed,
    /// Cancelled by the operator
    Cancelled,
    /// Receiver side: chunks arriving
    Receiving,
}

impl TransferStatus {
    /// Whether the state is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Serializable view of a transfer, carried in events and query replies.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSnapshot {
    /// Unique transfer id
    pub id: String,
    /// Peer device id
    pub device_id: String,
    /// Direction of flow
    pub direction: TransferDirection,
    /// Artifact file name
    pub file_name: String,
    /// Artifact size in bytes (0 until staged)
    pub size: u64,
    /// Whole-file checksum, hex (empty until computed)
    pub checksum: String,
    /// Current lifecycle state
    pub status: TransferStatus,
    /// Percent complete, 0-100, monotonic while transferring
    pub progress: u8,
    /// Concurrent streams for the current batch
    pub stream_count: usize,
    /// Most recent throughput sample, bytes/sec
    pub speed: f64,
    /// Failure cause once failed
    pub error: Option<String>,
}

/// Mutable state of one transfer.
#[derive(Debug)]
pub(crate) struct TransferState {
    pub file_name: String,
    pub source_path: PathBuf,
    pub temp_path: Option<PathBuf>,
    pub size: u64,
    pub checksum: String,
    pub is_directory: bool,
    pub status: TransferStatus,
    pub progress: u8,
    pub stream_count: usize,
    pub speed: f64,
    pub error: Option<String>,
    /// Chunk indices the peer has acknowledged; survives pause so resume
    /// skips them
    pub acked: HashSet<u64>,
    pub acked_bytes: u64,
}

/// Shared handle to one transfer, owned by the coordinator's map.
#[derive(Debug)]
pub struct TransferHandle {
    /// Unique transfer id
    pub id: String,
    /// Peer device id
    pub device_id: String,
    /// Direction of flow
    pub direction: TransferDirection,
    pub(crate) state: Mutex<TransferState>,
    cancelled: AtomicBool,
    paused: AtomicBool,
}

impl TransferHandle {
    pub(crate) fn new_send(id: &str, device_id: &str, source_path: PathBuf) -> Self {
        let file_name = source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_string());
        Self {
            id: id.to_string(),
            device_id: device_id.to_string(),
            direction: TransferDirection::Send,
            state: Mutex::new(TransferState {
                file_name,
                source_path,
                temp_path: None,
                size: 0,
                checksum: String::new(),
                is_directory: false,
                status: TransferStatus::Pending,
                progress: 0,
                stream_count: 1,
                speed: 0.0,
                error: None,
                acked: HashSet::new(),
                acked_bytes: 0,
            }),
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    pub(crate) fn new_receive(
        id: &str,
        device_id: &str,
        file_name: &str,
        size: u64,
        checksum: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            device_id: device_id.to_string(),
            direction: TransferDirection::Receive,
            state: Mutex::new(TransferState {
                file_name: file_name.to_string(),
                source_path: PathBuf::new(),
                temp_path: None,
                size,
                checksum: checksum.to_string(),
                is_directory: false,
                status: TransferStatus::Receiving,
                progress: 0,
                stream_count: 1,
                speed: 0.0,
                error: None,
                acked: HashSet::new(),
                acked_bytes: 0,
            }),
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    /// Current serializable view.
    #[must_use]
    pub fn snapshot(&self) -> TransferSnapshot {
        let state = self.state.lock().expect("transfer state lock poisoned");
        TransferSnapshot {
            id: self.id.clone(),
            device_id: self.device_id.clone(),
            direction: self.direction,
            file_name: state.file_name.clone(),
            size: state.size,
            checksum: state.checksum.clone(),
            status: state.status,
            progress: state.progress,
            stream_count: state.stream_count,
            speed: state.speed,
            error: state.error.clone(),
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TransferStatus {
        self.state.lock().expect("transfer state lock poisoned").status
    }

    pub(crate) fn set_status(&self, status: TransferStatus) {
        self.state
            .lock()
            .expect("transfer state lock poisoned")
            .status = status;
    }

    /// Record an acknowledged chunk and advance progress. Progress never
    /// decreases; duplicate acks are ignored.
    pub(crate) fn mark_acked(&self, index: u64, bytes: u64) {
        let mut state = self.state.lock().expect("transfer state lock poisoned");
        if state.acked.insert(index) {
            state.acked_bytes += bytes;
            if state.size > 0 {
                let pct = ((state.acked_bytes * 100) / state.size).min(100) as u8;
                state.progress = state.progress.max(pct);
            }
        }
    }

    /// Record received bytes on the receiving side and advance progress.
    pub(crate) fn set_received(&self, received_bytes: u64) {
        let mut state = self.state.lock().expect("transfer state lock poisoned");
        if state.size > 0 {
            let pct = ((received_bytes * 100) / state.size).min(100) as u8;
            state.progress = state.progress.max(pct);
        }
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut TransferState) -> R) -> R {
        let mut state = self.state.lock().expect("transfer state lock poisoned");
        f(&mut state)
    }

    /// Request cancellation; observed at the latest at the next batch start.
    pub(crate) fn request_cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Whether a pause was requested.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_monotonic_and_dedups_acks() {
        let handle = TransferHandle::new_send("t", "d", PathBuf::from("/tmp/file.bin"));
        handle.with_state(|s| s.size = 1000);

        handle.mark_acked(0, 500);
        assert_eq!(handle.snapshot().progress, 50);

        // Duplicate ack: no double counting.
        handle.mark_acked(0, 500);
        assert_eq!(handle.snapshot().progress, 50);

        handle.mark_acked(1, 500);
        assert_eq!(handle.snapshot().progress, 100);
    }

    #[test]
    fn terminal_states() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
        assert!(TransferStatus::Cancelled.is_terminal());
        assert!(!TransferStatus::Paused.is_terminal());
        assert!(!TransferStatus::Transferring.is_terminal());
    }

    #[test]
    fn send_handle_derives_file_name() {
        let handle = TransferHandle::new_send("t", "d", PathBuf::from("/data/photo.jpg"));
        assert_eq!(handle.snapshot().file_name, "photo.jpg");
        assert_eq!(handle.snapshot().status, TransferStatus::Pending);
    }
}
