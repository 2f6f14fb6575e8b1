//! Outbound transfer pipeline.
//!
//! `pending -> preparing -> (compressing) -> checksumming -> connecting ->
//! transferring -> {completed | failed | cancelled}`, with `paused` as a
//! resumable exit. Chunks are processed in strictly sequential batches; each
//! batch runs exactly `stream_count` concurrent send-and-await-ack
//! operations over the shared connection.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::{CertificateDer, ServerName};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use airlift_discovery::Device;
use airlift_files::{chunk_count, data_checksum, file_checksum, read_chunk_at, staging};
use airlift_trust::{VerifyOutcome, challenge};

use crate::coordinator::TransferCoordinator;
use crate::coordinator::wire::{AckRouter, Outbox, TaskGuard, spawn_reader};
use crate::error::{Result, TransferError};
use crate::event::Event;
use crate::frame::MessageType;
use crate::frame::messages::{ChunkData, TransferRequest, VerifyRequest};
use crate::transfer::{TransferHandle, TransferStatus};
use crate::{
    ACCEPT_TIMEOUT, ACK_TIMEOUT, CONNECT_TIMEOUT, MAX_CHUNK_ATTEMPTS, initial_stream_count,
};

/// How a pipeline run ended without failing.
enum Outcome {
    Completed,
    Paused,
}

/// Drive one outbound transfer to a terminal state (or a resumable pause).
pub(crate) async fn run(coordinator: Arc<TransferCoordinator>, handle: Arc<TransferHandle>) {
    match pipeline(&coordinator, &handle).await {
        Ok(Outcome::Completed) => {
            if let Some(temp) = handle.with_state(|s| s.temp_path.clone()) {
                staging::remove_artifact(&temp);
            }
            handle.with_state(|s| {
                s.status = TransferStatus::Completed;
                s.progress = 100;
            });
            tracing::info!("transfer {} completed", handle.id);
            coordinator
                .events
                .emit(Event::TransferComplete(handle.snapshot()));
        }
        Ok(Outcome::Paused) => {
            handle.set_status(TransferStatus::Paused);
            coordinator.emit_progress(&handle);
            tracing::info!("transfer {} paused", handle.id);
        }
        Err(TransferError::Cancelled) => {
            // cancel() already cleaned up, removed the record and notified.
            tracing::debug!("transfer {} pipeline observed cancellation", handle.id);
        }
        // A cancelled transfer's in-flight work may still error; those
        // results are discarded rather than reported.
        Err(_) if handle.is_cancelled() => {
            tracing::debug!("transfer {} failed after cancellation", handle.id);
        }
        Err(error) => {
            if let Some(temp) = handle.with_state(|s| s.temp_path.clone()) {
                staging::remove_artifact(&temp);
            }
            coordinator.fail_transfer(&handle, &error);
        }
    }
}

async fn pipeline(
    coordinator: &Arc<TransferCoordinator>,
    handle: &Arc<TransferHandle>,
) -> Result<Outcome> {
    let device = coordinator
        .registry
        .get(&handle.device_id)
        .ok_or_else(|| TransferError::Connection("device is no longer visible".to_string()))?;

    stage(coordinator, handle).await?;
    checksum(coordinator, handle).await?;

    handle.set_status(TransferStatus::Connecting);
    coordinator.emit_progress(handle);
    let stream = connect(coordinator, &device).await?;

    let peer_cert = peer_certificate(&stream)?;

    let (read_half, write_half) = tokio::io::split(stream);
    let router = Arc::new(AckRouter::new());
    let reader_task = spawn_reader(read_half, Arc::clone(&router));
    let (outbox, writer_task) = Outbox::start(write_half);
    let _guard = TaskGuard(vec![reader_task, writer_task]);

    // Trust gate: nothing is exchanged beyond the handshake until the peer
    // certificate is pinned and matching.
    match coordinator.trust.verify(&device.id, peer_cert.as_ref()) {
        VerifyOutcome::Pinned => {}
        VerifyOutcome::FingerprintMismatch => {
            return Err(TransferError::Trust(format!(
                "certificate fingerprint mismatch for {}",
                device.id
            )));
        }
        VerifyOutcome::NotPinned => {
            verify_first_contact(coordinator, &device, &peer_cert, &outbox, &router).await?;
        }
    }

    request_transfer(handle, &outbox, &router).await?;

    handle.set_status(TransferStatus::Transferring);
    coordinator.emit_progress(handle);
    stream_chunks(coordinator, handle, &outbox, &router).await
}

/// Stage the artifact into the outgoing area (skipped when a resume already
/// staged it).
async fn stage(coordinator: &Arc<TransferCoordinator>, handle: &Arc<TransferHandle>) -> Result<()> {
    handle.set_status(TransferStatus::Preparing);
    coordinator.emit_progress(handle);

    if let Some(temp) = handle.with_state(|s| s.temp_path.clone()) {
        if temp.exists() {
            return Ok(());
        }
    }

    let source = handle.with_state(|s| s.source_path.clone());
    let metadata = fs::metadata(&source)?;

    let (temp_path, size, is_directory) = if metadata.is_dir() {
        handle.set_status(TransferStatus::Compressing);
        coordinator.emit_progress(handle);

        let packager = Arc::clone(&coordinator.packager);
        let out_dir = coordinator.staging.outgoing_dir();
        let source = source.clone();
        let (artifact, size) = tokio::task::spawn_blocking(move || packager.pack(&source, &out_dir))
            .await
            .map_err(|e| TransferError::Connection(format!("packing task failed: {e}")))??;
        (artifact, size, true)
    } else {
        let staging = &coordinator.staging;
        let (path, size) = staging.stage_file(&handle.id, &source)?;
        (path, size, false)
    };

    if size == 0 {
        staging::remove_artifact(&temp_path);
        return Err(TransferError::Resource(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "cannot send an empty file",
        )));
    }

    handle.with_state(|s| {
        s.temp_path = Some(temp_path);
        s.size = size;
        s.is_directory = is_directory;
        s.stream_count = initial_stream_count(size);
    });
    Ok(())
}

/// Compute the whole-file checksum of the staged artifact (skipped on resume).
async fn checksum(
    coordinator: &Arc<TransferCoordinator>,
    handle: &Arc<TransferHandle>,
) -> Result<()> {
    if handle.with_state(|s| !s.checksum.is_empty()) {
        return Ok(());
    }
    handle.set_status(TransferStatus::Checksumming);
    coordinator.emit_progress(handle);

    let temp = handle
        .with_state(|s| s.temp_path.clone())
        .ok_or_else(|| TransferError::Connection("artifact not staged".to_string()))?;
    let digest = tokio::task::spawn_blocking(move || file_checksum(&temp))
        .await
        .map_err(|e| TransferError::Connection(format!("checksum task failed: {e}")))??;
    handle.with_state(|s| s.checksum = digest);
    Ok(())
}

async fn connect(
    coordinator: &Arc<TransferCoordinator>,
    device: &Device,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let address = SocketAddr::new(device.address, device.port);
    let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| TransferError::timeout("connect"))?
        .map_err(|e| TransferError::Connection(format!("connect {address}: {e}")))?;

    let connector = TlsConnector::from(Arc::new(crate::tls::client_config(&coordinator.identity)?));
    let server_name = ServerName::try_from("airlift")
        .map_err(|e| TransferError::Connection(format!("server name: {e}")))?;
    timeout(CONNECT_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| TransferError::timeout("TLS handshake"))?
        .map_err(|e| TransferError::Connection(format!("TLS handshake: {e}")))
}

fn peer_certificate(
    stream: &tokio_rustls::client::TlsStream<TcpStream>,
) -> Result<CertificateDer<'static>> {
    stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.clone().into_owned())
        .ok_or_else(|| TransferError::Trust("peer presented no certificate".to_string()))
}

/// First-contact verification: both operators compare a code derived from
/// the two certificate fingerprints and must accept before anything is
/// pinned or sent.
async fn verify_first_contact(
    coordinator: &Arc<TransferCoordinator>,
    device: &Device,
    peer_cert: &CertificateDer<'static>,
    outbox: &Outbox,
    router: &Arc<AckRouter>,
) -> Result<()> {
    let peer_fingerprint = airlift_trust::fingerprint_hex(peer_cert.as_ref());
    let code = challenge::derive_code(coordinator.identity.fingerprint(), &peer_fingerprint);
    coordinator.challenges.issue(&device.id, &code);

    let verdict = coordinator.await_verdict(&device.id);
    let remote = router.expect_verify();
    coordinator.events.emit(Event::VerificationRequired {
        device_id: device.id.clone(),
        code,
    });

    outbox
        .send(
            MessageType::VerifyRequest,
            &VerifyRequest {
                device_id: coordinator.local.id.clone(),
                device_name: coordinator.local.current_name(),
            },
        )
        .await?;

    let accepted = timeout(challenge::CHALLENGE_TTL, verdict)
        .await
        .map_err(|_| TransferError::Trust("verification expired".to_string()))?
        .map_err(|_| TransferError::Trust("verification abandoned".to_string()))?;
    if !accepted {
        return Err(TransferError::Trust(
            "verification rejected by local operator".to_string(),
        ));
    }

    let response = timeout(challenge::CHALLENGE_TTL, remote)
        .await
        .map_err(|_| TransferError::Trust("verification expired".to_string()))?
        .map_err(|_| {
            TransferError::Trust("connection closed during verification".to_string())
        })?;
    if !response.accepted {
        return Err(TransferError::Trust(
            "verification rejected by remote operator".to_string(),
        ));
    }

    coordinator.pin_peer(&device.id, &device.name, peer_cert.as_ref())?;
    Ok(())
}

async fn request_transfer(
    handle: &Arc<TransferHandle>,
    outbox: &Outbox,
    router: &Arc<AckRouter>,
) -> Result<()> {
    let request = handle.with_state(|s| TransferRequest {
        transfer_id: handle.id.clone(),
        file_name: s.file_name.clone(),
        file_size: s.size,
        checksum: s.checksum.clone(),
        is_directory: s.is_directory,
    });

    let accept = router.expect_accept();
    outbox.send(MessageType::TransferRequest, &request).await?;

    let reply = timeout(ACCEPT_TIMEOUT, accept)
        .await
        .map_err(|_| TransferError::timeout("transfer accept"))?
        .map_err(|_| TransferError::Connection("connection closed awaiting accept".to_string()))?;
    if !reply.accepted {
        return Err(TransferError::Connection(
            "transfer declined by peer".to_string(),
        ));
    }
    Ok(())
}

/// The batch loop. Cancellation and pause are observed at batch boundaries;
/// an in-flight batch may finish but its results are then discarded.
async fn stream_chunks(
    coordinator: &Arc<TransferCoordinator>,
    handle: &Arc<TransferHandle>,
    outbox: &Outbox,
    router: &Arc<AckRouter>,
) -> Result<Outcome> {
    let (temp_path, size, acked) = handle.with_state(|s| {
        (
            s.temp_path.clone().unwrap_or_default(),
            s.size,
            s.acked.clone(),
        )
    });
    let chunk_size = coordinator.config.chunk_size;
    let total_chunks = chunk_count(size, chunk_size);

    // Resume skips indices the peer already acknowledged.
    let pending: Vec<u64> = (0..total_chunks).filter(|i| !acked.contains(i)).collect();
    let mut streams = handle.with_state(|s| s.stream_count);
    let mut monitor = crate::monitor::SpeedMonitor::new();

    let mut cursor = 0;
    while cursor < pending.len() {
        if handle.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if handle.is_paused() {
            return Ok(Outcome::Paused);
        }

        let batch = &pending[cursor..(cursor + streams).min(pending.len())];
        let started = Instant::now();

        let mut in_flight = JoinSet::new();
        for &index in batch {
            in_flight.spawn(send_chunk(
                temp_path.clone(),
                chunk_size,
                handle.id.clone(),
                index,
                outbox.clone(),
                Arc::clone(router),
            ));
        }

        let mut batch_bytes = 0u64;
        while let Some(joined) = in_flight.join_next().await {
            let (index, bytes) = joined
                .map_err(|e| TransferError::Connection(format!("chunk task failed: {e}")))??;
            handle.mark_acked(index, bytes);
            batch_bytes += bytes;
        }
        cursor += batch.len();

        let elapsed = started.elapsed().as_secs_f64().max(1e-6);
        let speed = batch_bytes as f64 / elapsed;
        handle.with_state(|s| s.speed = speed);
        monitor.record_speed(speed);
        if let Some(next) = monitor.should_adjust(streams) {
            tracing::debug!(
                "transfer {}: adjusting streams {streams} -> {next}",
                handle.id
            );
            streams = next;
            handle.with_state(|s| s.stream_count = next);
        }
        coordinator.emit_progress(handle);
    }

    Ok(Outcome::Completed)
}

/// One chunk: read, hash, send, await the matching ack. Up to
/// [`MAX_CHUNK_ATTEMPTS`] attempts with a linear backoff of 1s x attempt
/// number; exhausting retries fails the whole transfer.
async fn send_chunk(
    path: PathBuf,
    chunk_size: usize,
    transfer_id: String,
    index: u64,
    outbox: Outbox,
    router: Arc<AckRouter>,
) -> Result<(u64, u64)> {
    let data = tokio::task::spawn_blocking(move || read_chunk_at(&path, chunk_size, index))
        .await
        .map_err(|e| TransferError::Connection(format!("read task failed: {e}")))??;
    let bytes = data.len() as u64;

    let message = ChunkData {
        transfer_id,
        chunk_index: index,
        checksum: data_checksum(&data),
        data,
    };

    let mut last_error = TransferError::timeout("chunk ack");
    for attempt in 1..=MAX_CHUNK_ATTEMPTS {
        let ack = router.expect_ack(index);
        outbox.send(MessageType::ChunkData, &message).await?;

        match timeout(ACK_TIMEOUT, ack).await {
            Ok(Ok(reply)) if reply.success => return Ok((index, bytes)),
            Ok(Ok(_)) => {
                last_error =
                    TransferError::Integrity(format!("chunk {index} rejected by receiver"));
            }
            Ok(Err(_)) => {
                last_error = TransferError::Connection("connection closed".to_string());
            }
            Err(_) => {
                router.forget_ack(index);
                last_error = TransferError::timeout("chunk ack");
            }
        }

        if attempt < MAX_CHUNK_ATTEMPTS {
            tracing::debug!("chunk {index} attempt {attempt} failed, retrying");
            tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
        }
    }
    Err(last_error)
}
