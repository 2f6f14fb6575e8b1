//! Inbound transfer handling.
//!
//! One task per accepted connection. Frames are reassembled incrementally;
//! chunks are verified, staged and acknowledged one by one; once the declared
//! byte count has arrived the artifact is reassembled in index order,
//! checked against the declared whole-file checksum, and only then delivered.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

use airlift_files::{ChunkStore, data_checksum, staging};
use airlift_trust::{VerifyOutcome, challenge, fingerprint_hex};

use crate::coordinator::TransferCoordinator;
use crate::coordinator::wire::{Outbox, TaskGuard};
use crate::error::{Result, TransferError};
use crate::event::Event;
use crate::frame::messages::{
    ChunkAck, ChunkData, TransferAccept, TransferRequest, VerifyRequest, VerifyResponse,
};
use crate::frame::{FrameDecoder, MessageType, RawFrame, decode_payload};
use crate::transfer::{TransferHandle, TransferStatus};

/// Accept loop: one task per inbound connection.
pub(crate) async fn serve(
    coordinator: Arc<TransferCoordinator>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("accept failed: {e}");
                continue;
            }
        };
        let coordinator = Arc::clone(&coordinator);
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor.accept(tcp).await {
                Ok(tls) => {
                    if let Err(e) = handle_connection(coordinator, tls, peer).await {
                        tracing::debug!("connection from {peer} ended: {e}");
                    }
                }
                Err(e) => tracing::debug!("TLS accept from {peer} failed: {e}"),
            }
        });
    }
}

/// One incoming transfer being staged on this connection.
struct Incoming {
    handle: Arc<TransferHandle>,
    store: Option<ChunkStore>,
    file_name: String,
    is_directory: bool,
    declared_checksum: String,
}

async fn handle_connection(
    coordinator: Arc<TransferCoordinator>,
    tls: TlsStream<TcpStream>,
    peer: SocketAddr,
) -> Result<()> {
    tracing::debug!("connection from {peer}");

    // The acceptor requires a client certificate, so the peer can be
    // fingerprinted before any transfer request is honored.
    let client_cert: Option<CertificateDer<'static>> = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.clone().into_owned());

    let (mut read_half, write_half) = tokio::io::split(tls);
    let (outbox, writer_task) = Outbox::start(write_half);
    let _guard = TaskGuard(vec![writer_task]);

    let mut incoming: HashMap<String, Incoming> = HashMap::new();
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 64 * 1024];

    let result = 'conn: loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break 'conn Ok(()),
            Ok(n) => n,
            Err(e) => break 'conn Err(TransferError::Connection(format!("read: {e}"))),
        };
        decoder.extend(&buf[..n]);
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if let Err(e) =
                        dispatch(&coordinator, &outbox, client_cert.as_ref(), &mut incoming, frame)
                            .await
                    {
                        break 'conn Err(e);
                    }
                }
                Ok(None) => break,
                // Framing is lost; nothing further on this stream parses.
                Err(e) => break 'conn Err(TransferError::Protocol(e.to_string())),
            }
        }
    };

    // The sender vanished mid-stream: no record may stay non-terminal.
    for (_, entry) in incoming.drain() {
        if !entry.handle.status().is_terminal() {
            if let Some(mut store) = entry.store {
                store.discard();
            }
            coordinator.fail_transfer(
                &entry.handle,
                &TransferError::Connection("connection lost mid-transfer".to_string()),
            );
        }
    }

    result
}

async fn dispatch(
    coordinator: &Arc<TransferCoordinator>,
    outbox: &Outbox,
    client_cert: Option<&CertificateDer<'static>>,
    incoming: &mut HashMap<String, Incoming>,
    frame: RawFrame,
) -> Result<()> {
    match MessageType::try_from(frame.kind) {
        Ok(MessageType::VerifyRequest) => {
            let Some(request) = decode_or_drop::<VerifyRequest>(&frame.payload) else {
                return Ok(());
            };
            handle_verify(coordinator, outbox, client_cert, request).await
        }
        Ok(MessageType::TransferRequest) => {
            let Some(request) = decode_or_drop::<TransferRequest>(&frame.payload) else {
                return Ok(());
            };
            handle_transfer_request(coordinator, outbox, client_cert, incoming, request).await
        }
        Ok(MessageType::ChunkData) => {
            let Some(chunk) = decode_or_drop::<ChunkData>(&frame.payload) else {
                return Ok(());
            };
            handle_chunk(coordinator, outbox, incoming, chunk).await
        }
        Ok(other) => {
            tracing::warn!("unexpected {other:?} on receiver connection, dropped");
            Ok(())
        }
        Err(e) => {
            tracing::warn!("{e}, dropped");
            Ok(())
        }
    }
}

/// Malformed payloads are dropped without tearing down the connection.
fn decode_or_drop<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Option<T> {
    match decode_payload::<T>(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!("malformed payload dropped: {e}");
            None
        }
    }
}

/// First-contact handshake, receiver side: derive the same code the sender
/// shows, surface it, await the local operator, pin on accept.
async fn handle_verify(
    coordinator: &Arc<TransferCoordinator>,
    outbox: &Outbox,
    client_cert: Option<&CertificateDer<'static>>,
    request: VerifyRequest,
) -> Result<()> {
    let verdict_response = |accepted: bool| VerifyResponse {
        device_id: coordinator.local.id.clone(),
        accepted,
    };

    let Some(cert) = client_cert else {
        tracing::warn!("verification request without client certificate");
        return outbox
            .send(MessageType::VerifyResponse, &verdict_response(false))
            .await;
    };

    let code = challenge::derive_code(
        coordinator.identity.fingerprint(),
        &fingerprint_hex(cert.as_ref()),
    );
    coordinator.challenges.issue(&request.device_id, &code);
    let verdict = coordinator.await_verdict(&request.device_id);
    coordinator.events.emit(Event::VerificationRequired {
        device_id: request.device_id.clone(),
        code,
    });

    let accepted = matches!(
        timeout(challenge::CHALLENGE_TTL, verdict).await,
        Ok(Ok(true))
    );
    if accepted {
        coordinator.pin_peer(&request.device_id, &request.device_name, cert.as_ref())?;
    } else {
        tracing::info!("verification for {} not accepted", request.device_id);
    }
    outbox
        .send(MessageType::VerifyResponse, &verdict_response(accepted))
        .await
}

/// Stage a destination for an incoming transfer, gated on the client
/// certificate being pinned. Unpinned or mismatched peers are declined.
async fn handle_transfer_request(
    coordinator: &Arc<TransferCoordinator>,
    outbox: &Outbox,
    client_cert: Option<&CertificateDer<'static>>,
    incoming: &mut HashMap<String, Incoming>,
    request: TransferRequest,
) -> Result<()> {
    let decline = TransferAccept {
        transfer_id: request.transfer_id.clone(),
        accepted: false,
    };

    let device_id = client_cert
        .map(|cert| fingerprint_hex(cert.as_ref()))
        .and_then(|fp| coordinator.trust.device_for_fingerprint(&fp));
    let Some(device_id) = device_id else {
        tracing::warn!(
            "transfer request {} from untrusted peer declined",
            request.transfer_id
        );
        return outbox.send(MessageType::TransferAccept, &decline).await;
    };
    // Double-check the live certificate against the pin before honoring.
    if let Some(cert) = client_cert {
        if coordinator.trust.verify(&device_id, cert.as_ref()) != VerifyOutcome::Pinned {
            return outbox.send(MessageType::TransferAccept, &decline).await;
        }
    }

    let store = match ChunkStore::create(
        coordinator.staging.incoming_dir(&request.transfer_id),
        request.file_size,
        coordinator.config.chunk_size,
    ) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("failed to stage incoming transfer: {e}");
            return outbox.send(MessageType::TransferAccept, &decline).await;
        }
    };

    let handle = Arc::new(TransferHandle::new_receive(
        &request.transfer_id,
        &device_id,
        &request.file_name,
        request.file_size,
        &request.checksum,
    ));
    coordinator
        .transfers
        .insert(request.transfer_id.clone(), Arc::clone(&handle));
    coordinator.emit_progress(&handle);

    incoming.insert(
        request.transfer_id.clone(),
        Incoming {
            handle,
            store: Some(store),
            file_name: request.file_name.clone(),
            is_directory: request.is_directory,
            declared_checksum: request.checksum.clone(),
        },
    );

    tracing::info!(
        "accepting transfer {} ({}, {} bytes)",
        request.transfer_id,
        request.file_name,
        request.file_size
    );
    outbox
        .send(
            MessageType::TransferAccept,
            &TransferAccept {
                transfer_id: request.transfer_id,
                accepted: true,
            },
        )
        .await
}

/// Verify, persist and acknowledge one chunk; finalize once every declared
/// byte has arrived.
async fn handle_chunk(
    coordinator: &Arc<TransferCoordinator>,
    outbox: &Outbox,
    incoming: &mut HashMap<String, Incoming>,
    chunk: ChunkData,
) -> Result<()> {
    let ack = |success: bool| ChunkAck {
        transfer_id: chunk.transfer_id.clone(),
        chunk_index: chunk.chunk_index,
        success,
    };

    let Some(entry) = incoming.get_mut(&chunk.transfer_id) else {
        tracing::warn!("chunk for unknown transfer {}", chunk.transfer_id);
        return outbox.send(MessageType::ChunkAck, &ack(false)).await;
    };

    if entry.handle.is_cancelled() {
        return outbox.send(MessageType::ChunkAck, &ack(false)).await;
    }

    // Integrity check before anything is persisted or counted.
    if data_checksum(&chunk.data) != chunk.checksum {
        tracing::warn!(
            "chunk {} of {} failed checksum",
            chunk.chunk_index,
            chunk.transfer_id
        );
        return outbox.send(MessageType::ChunkAck, &ack(false)).await;
    }

    let Some(store) = entry.store.as_mut() else {
        return outbox.send(MessageType::ChunkAck, &ack(false)).await;
    };
    if let Err(e) = store.write_chunk(chunk.chunk_index, &chunk.data) {
        let error = TransferError::Resource(e);
        if let Some(mut store) = entry.store.take() {
            store.discard();
        }
        coordinator.fail_transfer(&entry.handle, &error);
        incoming.remove(&chunk.transfer_id);
        return outbox.send(MessageType::ChunkAck, &ack(false)).await;
    }

    entry.handle.set_received(store.received_bytes());
    let complete = store.is_complete();
    coordinator.emit_progress(&entry.handle);
    outbox.send(MessageType::ChunkAck, &ack(true)).await?;

    if complete {
        let entry = incoming
            .remove(&chunk.transfer_id)
            .expect("entry present above");
        finalize(coordinator, &chunk.transfer_id, entry).await;
    }
    Ok(())
}

/// Reassemble, verify the whole-file checksum, and deliver.
async fn finalize(coordinator: &Arc<TransferCoordinator>, transfer_id: &str, entry: Incoming) {
    let Incoming {
        handle,
        store,
        file_name,
        is_directory,
        declared_checksum,
    } = entry;
    let Some(store) = store else {
        return;
    };

    let artifact = coordinator.staging.incoming_artifact(transfer_id, &file_name);
    let assemble_path = artifact.clone();
    let assembled = tokio::task::spawn_blocking(move || {
        let mut store = store;
        let result = store.assemble(&assemble_path);
        (store, result)
    })
    .await;

    let (mut store, checksum_result) = match assembled {
        Ok(parts) => parts,
        Err(e) => {
            coordinator.fail_transfer(
                &handle,
                &TransferError::Connection(format!("assembly task failed: {e}")),
            );
            return;
        }
    };

    let actual = match checksum_result {
        Ok(actual) => actual,
        Err(e) => {
            store.discard();
            coordinator.fail_transfer(&handle, &TransferError::Resource(e));
            return;
        }
    };

    // A mismatched artifact is never delivered.
    if actual != declared_checksum {
        store.discard();
        staging::remove_artifact(&artifact);
        coordinator.fail_transfer(
            &handle,
            &TransferError::Integrity("whole-file checksum mismatch".to_string()),
        );
        return;
    }

    if let Err(e) = deliver(coordinator, &artifact, &file_name, is_directory) {
        staging::remove_artifact(&artifact);
        coordinator.fail_transfer(&handle, &TransferError::Resource(e));
        return;
    }

    handle.with_state(|s| {
        s.status = TransferStatus::Completed;
        s.progress = 100;
    });
    tracing::info!("received {file_name} ({transfer_id})");
    coordinator
        .events
        .emit(Event::TransferComplete(handle.snapshot()));
}

/// Move the verified artifact into the download directory, unpacking
/// directory payloads through the packager.
fn deliver(
    coordinator: &Arc<TransferCoordinator>,
    artifact: &Path,
    file_name: &str,
    is_directory: bool,
) -> std::io::Result<()> {
    std::fs::create_dir_all(&coordinator.config.download_dir)?;

    if is_directory {
        coordinator
            .packager
            .unpack(artifact, &coordinator.config.download_dir)?;
        std::fs::remove_file(artifact)?;
        return Ok(());
    }

    let dest = unique_destination(&coordinator.config.download_dir, file_name);
    match std::fs::rename(artifact, &dest) {
        Ok(()) => Ok(()),
        // Staging and downloads may sit on different filesystems.
        Err(_) => {
            std::fs::copy(artifact, &dest)?;
            std::fs::remove_file(artifact)
        }
    }
}

/// First non-colliding path for a delivered file: `name.ext`, `name (1).ext`,
/// `name (2).ext`, ...
fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, extension) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (file_name.to_string(), String::new()),
    };
    for n in 1.. {
        let candidate = dir.join(format!("{stem} ({n}){extension}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn unique_destination_appends_counter() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(
            unique_destination(tmp.path(), "a.txt"),
            tmp.path().join("a.txt")
        );

        std::fs::write(tmp.path().join("a.txt"), b"x").unwrap();
        assert_eq!(
            unique_destination(tmp.path(), "a.txt"),
            tmp.path().join("a (1).txt")
        );

        std::fs::write(tmp.path().join("a (1).txt"), b"x").unwrap();
        assert_eq!(
            unique_destination(tmp.path(), "a.txt"),
            tmp.path().join("a (2).txt")
        );
    }

    #[test]
    fn unique_destination_without_extension() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("README"), b"x").unwrap();
        assert_eq!(
            unique_destination(tmp.path(), "README"),
            tmp.path().join("README (1)")
        );
    }
}
