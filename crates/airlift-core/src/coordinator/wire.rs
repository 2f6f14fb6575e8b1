//! Per-connection plumbing: serialized frame writer and ack routing.
//!
//! One connection carries several concurrent chunk streams, so writes go
//! through a single outbox task and inbound frames are routed to whichever
//! stream is waiting on them.

use std::sync::Mutex;

use dashmap::DashMap;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, TransferError};
use crate::frame::messages::{ChunkAck, TransferAccept, VerifyResponse};
use crate::frame::{MessageType, RawFrame, decode_payload, encode_message};

/// Aborts its tasks when the owning scope ends.
pub(crate) struct TaskGuard(pub Vec<JoinHandle<()>>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Clonable handle that serializes frame writes onto one connection.
#[derive(Clone)]
pub(crate) struct Outbox {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Outbox {
    /// Spawn the writer task over the connection's write half.
    pub(crate) fn start<W>(mut writer: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        let task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = writer.write_all(&frame).await {
                    tracing::debug!("connection write failed: {e}");
                    break;
                }
                if let Err(e) = writer.flush().await {
                    tracing::debug!("connection flush failed: {e}");
                    break;
                }
            }
        });
        (Self { tx }, task)
    }

    /// Encode and queue one message.
    pub(crate) async fn send<T: Serialize>(&self, kind: MessageType, message: &T) -> Result<()> {
        let frame = encode_message(kind, message)
            .map_err(|e| TransferError::Protocol(e.to_string()))?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransferError::Connection("connection closed".to_string()))
    }
}

/// Routes inbound frames on the sender side to their waiting operations.
#[derive(Default)]
pub(crate) struct AckRouter {
    acks: DashMap<u64, oneshot::Sender<ChunkAck>>,
    accept: Mutex<Option<oneshot::Sender<TransferAccept>>>,
    verify: Mutex<Option<oneshot::Sender<VerifyResponse>>>,
}

impl AckRouter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register interest in the ack for one chunk index.
    pub(crate) fn expect_ack(&self, index: u64) -> oneshot::Receiver<ChunkAck> {
        let (tx, rx) = oneshot::channel();
        self.acks.insert(index, tx);
        rx
    }

    /// Drop a stale ack waiter after a timed-out attempt.
    pub(crate) fn forget_ack(&self, index: u64) {
        self.acks.remove(&index);
    }

    /// Register interest in the transfer-accept reply.
    pub(crate) fn expect_accept(&self) -> oneshot::Receiver<TransferAccept> {
        let (tx, rx) = oneshot::channel();
        *self.accept.lock().expect("accept slot poisoned") = Some(tx);
        rx
    }

    /// Register interest in the verification reply.
    pub(crate) fn expect_verify(&self) -> oneshot::Receiver<VerifyResponse> {
        let (tx, rx) = oneshot::channel();
        *self.verify.lock().expect("verify slot poisoned") = Some(tx);
        rx
    }

    /// Deliver one inbound frame. Unknown types and unparseable payloads are
    /// dropped without tearing down the connection.
    pub(crate) fn route(&self, frame: &RawFrame) {
        match MessageType::try_from(frame.kind) {
            Ok(MessageType::ChunkAck) => match decode_payload::<ChunkAck>(&frame.payload) {
                Ok(ack) => {
                    if let Some((_, waiter)) = self.acks.remove(&ack.chunk_index) {
                        let _ = waiter.send(ack);
                    } else {
                        tracing::debug!("ack for chunk {} had no waiter", ack.chunk_index);
                    }
                }
                Err(e) => tracing::warn!("malformed chunk ack dropped: {e}"),
            },
            Ok(MessageType::TransferAccept) => {
                match decode_payload::<TransferAccept>(&frame.payload) {
                    Ok(accept) => {
                        if let Some(waiter) =
                            self.accept.lock().expect("accept slot poisoned").take()
                        {
                            let _ = waiter.send(accept);
                        }
                    }
                    Err(e) => tracing::warn!("malformed transfer accept dropped: {e}"),
                }
            }
            Ok(MessageType::VerifyResponse) => {
                match decode_payload::<VerifyResponse>(&frame.payload) {
                    Ok(response) => {
                        if let Some(waiter) =
                            self.verify.lock().expect("verify slot poisoned").take()
                        {
                            let _ = waiter.send(response);
                        }
                    }
                    Err(e) => tracing::warn!("malformed verify response dropped: {e}"),
                }
            }
            Ok(other) => tracing::warn!("unexpected {other:?} on sender connection, dropped"),
            Err(e) => tracing::warn!("{e}, dropped"),
        }
    }
}

/// Read frames off the connection and feed the router until EOF or error.
pub(crate) fn spawn_reader<R>(mut reader: R, router: std::sync::Arc<AckRouter>) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    use tokio::io::AsyncReadExt;

    tokio::spawn(async move {
        let mut decoder = crate::frame::FrameDecoder::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("connection read failed: {e}");
                    break;
                }
            };
            decoder.extend(&buf[..n]);
            loop {
                match decoder.next_frame() {
                    Ok(Some(frame)) => router.route(&frame),
                    Ok(None) => break,
                    Err(e) => {
                        // Framing is lost; the stream cannot recover.
                        tracing::warn!("unrecoverable framing error: {e}");
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_message;

    #[tokio::test]
    async fn router_delivers_acks_by_index() {
        let router = AckRouter::new();
        let rx = router.expect_ack(7);

        let ack = ChunkAck {
            transfer_id: "t".to_string(),
            chunk_index: 7,
            success: true,
        };
        let frame = encode_message(MessageType::ChunkAck, &ack).unwrap();
        router.route(&RawFrame {
            kind: frame[4],
            payload: frame[5..].to_vec(),
        });

        let delivered = rx.await.unwrap();
        assert!(delivered.success);
        assert_eq!(delivered.chunk_index, 7);
    }

    #[tokio::test]
    async fn duplicate_acks_are_dropped() {
        let router = AckRouter::new();
        let rx = router.expect_ack(1);

        let ack = ChunkAck {
            transfer_id: "t".to_string(),
            chunk_index: 1,
            success: true,
        };
        let payload = serde_json::to_vec(&ack).unwrap();
        let frame = RawFrame {
            kind: MessageType::ChunkAck as u8,
            payload,
        };
        router.route(&frame);
        router.route(&frame);

        assert!(rx.await.unwrap().success);
    }

    #[test]
    fn unknown_types_do_not_panic() {
        let router = AckRouter::new();
        router.route(&RawFrame {
            kind: 200,
            payload: vec![],
        });
        router.route(&RawFrame {
            kind: MessageType::ChunkData as u8,
            payload: b"{}".to_vec(),
        });
    }
}
