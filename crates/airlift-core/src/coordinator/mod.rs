//! The transfer coordinator: the protocol engine.
//!
//! Owns the active-transfer map, runs the TLS listener for inbound transfers,
//! spawns one sender pipeline per outbound transfer, and drives the
//! verification handshake. Each transfer runs in its own task; different
//! transfers to different devices proceed fully independently.

mod receiver;
mod sender;
mod wire;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use airlift_discovery::{DeviceRegistry, LocalDevice};
use airlift_files::{CHUNK_SIZE, Packager, Staging, staging};
use airlift_trust::{ChallengeBook, DeviceIdentity, TrustStore};

use crate::error::{Result, TransferError};
use crate::event::{Event, EventBus};
use crate::TRANSFER_PORT;
use crate::tls;
use crate::transfer::{TransferHandle, TransferSnapshot, TransferStatus};

/// Coordinator tunables and paths.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// TCP port to listen on; 0 picks an ephemeral port
    pub listen_port: u16,
    /// Where verified incoming files are delivered
    pub download_dir: PathBuf,
    /// Where temp artifacts and chunk staging live
    pub staging_dir: PathBuf,
    /// Transfer chunk size
    pub chunk_size: usize,
}

impl CoordinatorConfig {
    /// Config with the well-known port and default chunk size.
    #[must_use]
    pub fn new(download_dir: PathBuf, staging_dir: PathBuf) -> Self {
        Self {
            listen_port: TRANSFER_PORT,
            download_dir,
            staging_dir,
            chunk_size: CHUNK_SIZE,
        }
    }
}

/// The protocol engine.
pub struct TransferCoordinator {
    self_ref: Weak<TransferCoordinator>,
    pub(crate) local: LocalDevice,
    pub(crate) identity: Arc<DeviceIdentity>,
    pub(crate) trust: Arc<TrustStore>,
    pub(crate) challenges: ChallengeBook,
    pub(crate) registry: Arc<DeviceRegistry>,
    pub(crate) events: EventBus,
    pub(crate) transfers: DashMap<String, Arc<TransferHandle>>,
    verdicts: DashMap<String, Vec<oneshot::Sender<bool>>>,
    pub(crate) staging: Staging,
    pub(crate) packager: Arc<dyn Packager>,
    pub(crate) config: CoordinatorConfig,
    server: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl TransferCoordinator {
    /// Build a coordinator. The staging area is created eagerly.
    ///
    /// # Errors
    ///
    /// Returns an error if the staging directories cannot be created.
    pub fn new(
        local: LocalDevice,
        identity: Arc<DeviceIdentity>,
        trust: Arc<TrustStore>,
        registry: Arc<DeviceRegistry>,
        events: EventBus,
        packager: Arc<dyn Packager>,
        config: CoordinatorConfig,
    ) -> Result<Arc<Self>> {
        let staging = Staging::open(&config.staging_dir)?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            local,
            identity,
            trust,
            challenges: ChallengeBook::new(),
            registry,
            events,
            transfers: DashMap::new(),
            verdicts: DashMap::new(),
            staging,
            packager,
            config,
            server: Mutex::new(None),
            local_addr: Mutex::new(None),
        }))
    }

    /// Strong handle back to this coordinator for spawned tasks. Only
    /// callable while the owning `Arc` is alive.
    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("coordinator dropped")
    }

    /// Bind the TLS listener and start accepting inbound transfers.
    ///
    /// # Errors
    ///
    /// Returns an error if binding or TLS setup fails.
    pub async fn start(&self) -> Result<()> {
        let bind = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.config.listen_port,
        );
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| TransferError::Connection(format!("bind {bind}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransferError::Connection(e.to_string()))?;
        let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(&self.identity)?));

        tracing::info!("transfer engine listening on {local_addr}");
        *self.local_addr.lock().expect("local addr lock poisoned") = Some(local_addr);

        let coordinator = self.arc();
        let task = tokio::spawn(receiver::serve(coordinator, listener, acceptor));
        *self.server.lock().expect("server slot poisoned") = Some(task);
        Ok(())
    }

    /// Address the listener actually bound, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local addr lock poisoned")
    }

    /// Stop accepting inbound transfers. Running pipelines are not torn down.
    pub async fn stop(&self) {
        if let Some(task) = self.server.lock().expect("server slot poisoned").take() {
            task.abort();
        }
    }

    /// Generate a random transfer or device identifier.
    #[must_use]
    pub fn generate_id() -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Queue one outbound transfer per (device, path) pair and start their
    /// pipelines. Unknown devices are skipped with a warning.
    pub fn send_files(&self, device_ids: &[String], paths: &[PathBuf]) -> Vec<TransferSnapshot> {
        let mut queued = Vec::new();
        for device_id in device_ids {
            if self.registry.get(device_id).is_none() {
                tracing::warn!("device {device_id} not found, skipping");
                continue;
            }
            for path in paths {
                let id = Self::generate_id();
                let handle = Arc::new(TransferHandle::new_send(&id, device_id, path.clone()));
                self.transfers.insert(id.clone(), Arc::clone(&handle));
                self.emit_progress(&handle);
                queued.push(handle.snapshot());

                let coordinator = self.arc();
                tokio::spawn(sender::run(coordinator, handle));
            }
        }
        queued
    }

    /// Snapshot every transfer still in the map.
    #[must_use]
    pub fn transfers(&self) -> Vec<TransferSnapshot> {
        self.transfers.iter().map(|t| t.snapshot()).collect()
    }

    /// Snapshot one transfer.
    #[must_use]
    pub fn get_transfer(&self, transfer_id: &str) -> Option<TransferSnapshot> {
        self.transfers.get(transfer_id).map(|t| t.snapshot())
    }

    /// Pause a transferring transfer. No teardown; the pipeline stops at the
    /// next batch boundary.
    pub fn pause(&self, transfer_id: &str) -> bool {
        let Some(handle) = self.transfers.get(transfer_id) else {
            return false;
        };
        if handle.status() != TransferStatus::Transferring {
            return false;
        }
        handle.set_paused(true);
        true
    }

    /// Resume a paused transfer by re-entering the pipeline from the top.
    /// Chunks already acknowledged are skipped.
    pub fn resume(&self, transfer_id: &str) -> bool {
        let Some(handle) = self.transfers.get(transfer_id) else {
            return false;
        };
        if handle.status() != TransferStatus::Paused {
            return false;
        }
        handle.set_paused(false);
        handle.set_status(TransferStatus::Pending);

        let coordinator = self.arc();
        let handle = Arc::clone(&handle);
        tokio::spawn(sender::run(coordinator, handle));
        true
    }

    /// Cancel a transfer: mark it, best-effort delete its temp artifact, and
    /// remove it from the active map regardless of cleanup errors. In-flight
    /// chunk operations may still complete; their results are discarded.
    pub fn cancel(&self, transfer_id: &str) -> bool {
        let Some((_, handle)) = self.transfers.remove(transfer_id) else {
            return false;
        };
        handle.request_cancel();
        handle.set_status(TransferStatus::Cancelled);
        if let Some(temp) = handle.with_state(|s| s.temp_path.clone()) {
            staging::remove_artifact(&temp);
        }
        self.events.emit(Event::TransferProgress(handle.snapshot()));
        tracing::info!("transfer {transfer_id} cancelled");
        true
    }

    /// Deliver the operator's verdict for a pending verification. Returns
    /// false when no live challenge exists (never issued, or expired).
    pub fn respond_verification(&self, device_id: &str, accept: bool) -> bool {
        if self.challenges.take_live(device_id).is_none() {
            return false;
        }
        if let Some((_, waiters)) = self.verdicts.remove(device_id) {
            for waiter in waiters {
                let _ = waiter.send(accept);
            }
        }
        true
    }

    /// Register a waiter for the operator verdict on a device.
    pub(crate) fn await_verdict(&self, device_id: &str) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.verdicts
            .entry(device_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Emit a progress event with the transfer's current snapshot.
    pub(crate) fn emit_progress(&self, handle: &TransferHandle) {
        self.events.emit(Event::TransferProgress(handle.snapshot()));
    }

    /// Mark a transfer failed with its triggering cause and emit the error
    /// event. Every failure path lands here, so no record stays non-terminal.
    pub(crate) fn fail_transfer(&self, handle: &TransferHandle, error: &TransferError) {
        let message = error.to_string();
        handle.with_state(|s| {
            s.status = TransferStatus::Failed;
            s.error = Some(message.clone());
        });
        tracing::warn!("transfer {} failed: {message}", handle.id);
        self.events.emit(Event::TransferError {
            transfer: handle.snapshot(),
            error: message,
        });
    }

    /// Map a trust-store persistence failure onto the transfer taxonomy.
    pub(crate) fn pin_peer(
        &self,
        device_id: &str,
        device_name: &str,
        cert_der: &[u8],
    ) -> Result<()> {
        self.trust
            .pin(device_id, device_name, cert_der)
            .map_err(|e| TransferError::Resource(std::io::Error::other(e.to_string())))
    }
}
