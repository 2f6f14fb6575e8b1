//! The node facade: discovery, trust and transfers wired together behind the
//! query/notification surface the embedding shell consumes.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use airlift_discovery::{
    BroadcastConfig, BroadcastDiscovery, Device, DeviceRegistry, Discovery, LocalDevice,
    MdnsConfig, MdnsDiscovery, RegistryEvent,
};
use airlift_files::{Packager, PassthroughPackager};
use airlift_trust::{DeviceIdentity, TrustStore};

use crate::coordinator::{CoordinatorConfig, TransferCoordinator};
use crate::error::{Result, TransferError};
use crate::event::{Event, EventBus};
use crate::transfer::TransferSnapshot;

/// Which presence strategy the node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryBackend {
    /// UDP broadcast datagrams on the discovery port
    Broadcast,
    /// mDNS service advertisement
    Mdns,
}

/// Everything needed to bring a node up.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable local device id
    pub device_id: String,
    /// Local display name
    pub device_name: String,
    /// Operating system family advertised to peers
    pub platform: String,
    /// Application version advertised to peers
    pub version: String,
    /// Per-user configuration directory (identity, trust store)
    pub config_dir: PathBuf,
    /// Where delivered files land
    pub download_dir: PathBuf,
    /// Where temp artifacts and chunk staging live
    pub staging_dir: PathBuf,
    /// TCP port for the transfer engine
    pub listen_port: u16,
    /// Presence strategy
    pub backend: DiscoveryBackend,
}

/// A running Airlift node.
pub struct Node {
    local: LocalDevice,
    registry: Arc<DeviceRegistry>,
    trust: Arc<TrustStore>,
    coordinator: Arc<TransferCoordinator>,
    discovery: Box<dyn Discovery>,
    events: EventBus,
    aliases: DashMap<String, String>,
    bridge: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Bring the node up: identity, trust store, transfer engine, discovery,
    /// event bridging.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity cannot be established, the listener
    /// cannot bind, or discovery cannot start.
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>> {
        Self::start_with_packager(config, Arc::new(PassthroughPackager)).await
    }

    /// Same as [`Node::start`] with a custom directory packager.
    ///
    /// # Errors
    ///
    /// See [`Node::start`].
    pub async fn start_with_packager(
        config: NodeConfig,
        packager: Arc<dyn Packager>,
    ) -> Result<Arc<Self>> {
        let identity = DeviceIdentity::load_or_generate(&config.config_dir.join("certs"))
            .map_err(|e| TransferError::Resource(std::io::Error::other(e.to_string())))?;
        let identity = Arc::new(identity);
        let trust = Arc::new(TrustStore::load(config.config_dir.join("pinned_certs.json")));
        let registry = Arc::new(DeviceRegistry::new());
        let events = EventBus::new();

        let local = LocalDevice::new(
            &config.device_id,
            &config.device_name,
            &config.platform,
            &config.version,
            config.listen_port,
        );

        let coordinator = TransferCoordinator::new(
            local.clone(),
            Arc::clone(&identity),
            Arc::clone(&trust),
            Arc::clone(&registry),
            events.clone(),
            packager,
            CoordinatorConfig {
                listen_port: config.listen_port,
                download_dir: config.download_dir.clone(),
                staging_dir: config.staging_dir.clone(),
                chunk_size: airlift_files::CHUNK_SIZE,
            },
        )?;
        coordinator.start().await?;

        let discovery: Box<dyn Discovery> = match config.backend {
            DiscoveryBackend::Broadcast => Box::new(BroadcastDiscovery::new(
                local.clone(),
                Arc::clone(&registry),
                BroadcastConfig::default(),
            )),
            DiscoveryBackend::Mdns => Box::new(MdnsDiscovery::new(
                local.clone(),
                Arc::clone(&registry),
                MdnsConfig::default(),
            )),
        };
        discovery
            .start()
            .await
            .map_err(|e| TransferError::Connection(format!("discovery: {e}")))?;

        let node = Arc::new(Self {
            local,
            registry,
            trust,
            coordinator,
            discovery,
            events,
            aliases: DashMap::new(),
            bridge: Mutex::new(None),
        });

        let bridge = tokio::spawn(bridge_registry_events(Arc::clone(&node)));
        *node.bridge.lock().expect("bridge slot poisoned") = Some(bridge);

        Ok(node)
    }

    /// Subscribe to all node events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// All currently visible devices with trust and alias overlays applied.
    #[must_use]
    pub fn devices(&self) -> Vec<Device> {
        self.registry
            .list()
            .into_iter()
            .map(|device| self.overlay(device))
            .collect()
    }

    fn overlay(&self, mut device: Device) -> Device {
        device.trusted = self.trust.is_pinned(&device.id);
        device.alias = self.aliases.get(&device.id).map(|a| a.clone());
        device
    }

    /// The local display name.
    #[must_use]
    pub fn local_name(&self) -> String {
        self.local.current_name()
    }

    /// Rename the local device; takes effect on the next announce cycle.
    pub fn rename_local(&self, name: &str) {
        self.discovery.update_local_name(name);
    }

    /// Forget a device: drop its pinned credential.
    ///
    /// # Errors
    ///
    /// Returns an error if the trust store cannot be persisted.
    pub fn forget_device(&self, device_id: &str) -> Result<bool> {
        self.aliases.remove(device_id);
        self.trust
            .unpin(device_id)
            .map_err(|e| TransferError::Resource(std::io::Error::other(e.to_string())))
    }

    /// Set or clear a display alias for a device.
    pub fn set_alias(&self, device_id: &str, alias: Option<&str>) {
        match alias {
            Some(alias) => {
                self.aliases.insert(device_id.to_string(), alias.to_string());
            }
            None => {
                self.aliases.remove(device_id);
            }
        }
    }

    /// Send files to a set of devices. Returns the queued transfers.
    #[must_use]
    pub fn send(&self, device_ids: &[String], paths: &[PathBuf]) -> Vec<TransferSnapshot> {
        self.coordinator.send_files(device_ids, paths)
    }

    /// Snapshot all transfers.
    #[must_use]
    pub fn transfers(&self) -> Vec<TransferSnapshot> {
        self.coordinator.transfers()
    }

    /// Pause a transferring transfer.
    pub fn pause_transfer(&self, transfer_id: &str) -> bool {
        self.coordinator.pause(transfer_id)
    }

    /// Resume a paused transfer.
    pub fn resume_transfer(&self, transfer_id: &str) -> bool {
        self.coordinator.resume(transfer_id)
    }

    /// Cancel a transfer.
    pub fn cancel_transfer(&self, transfer_id: &str) -> bool {
        self.coordinator.cancel(transfer_id)
    }

    /// Deliver the operator's verification verdict for a device.
    pub fn respond_verification(&self, device_id: &str, accept: bool) -> bool {
        self.coordinator.respond_verification(device_id, accept)
    }

    /// The trust store, for enumeration surfaces.
    #[must_use]
    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// Shut the node down.
    pub async fn stop(&self) {
        self.discovery.stop().await;
        self.coordinator.stop().await;
        if let Some(bridge) = self.bridge.lock().expect("bridge slot poisoned").take() {
            bridge.abort();
        }
    }
}

/// Forward registry events onto the unified bus with overlays applied.
async fn bridge_registry_events(node: Arc<Node>) {
    let mut rx = node.registry.subscribe();
    loop {
        match rx.recv().await {
            Ok(RegistryEvent::Found(device)) => {
                let device = node.overlay(device);
                node.events.emit(Event::DeviceFound(device));
            }
            Ok(RegistryEvent::Lost(device_id)) => {
                node.events.emit(Event::DeviceLost { device_id });
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("registry bridge lagged, skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
