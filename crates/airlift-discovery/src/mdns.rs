//! mDNS service-advertisement discovery strategy.
//!
//! Publishes a named service record with device metadata in TXT fields,
//! browses for peer records, and maps record up/down to registry
//! upsert/remove. Staleness handling is delegated to the registry's own
//! periodic sweep.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::registry::{DEFAULT_STALE_TIMEOUT, DEFAULT_SWEEP_INTERVAL, DeviceRegistry, Observation};
use crate::{Discovery, DiscoveryError, LocalDevice, SERVICE_TYPE};

/// Tunables for the mDNS strategy.
#[derive(Debug, Clone)]
pub struct MdnsConfig {
    /// Service type to publish and browse
    pub service_type: String,
    /// Interval between delegated registry sweeps
    pub sweep_interval: Duration,
    /// Age beyond which an unseen device is evicted
    pub stale_timeout: Duration,
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            service_type: SERVICE_TYPE.to_string(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
        }
    }
}

/// The service-advertisement strategy.
pub struct MdnsDiscovery {
    local: LocalDevice,
    registry: Arc<DeviceRegistry>,
    config: MdnsConfig,
    daemon: Mutex<Option<ServiceDaemon>>,
    registered: Mutex<Option<String>>,
    /// Resolved record fullname -> device id, for mapping removals
    seen: Arc<DashMap<String, String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MdnsDiscovery {
    /// Build the strategy over a registry.
    #[must_use]
    pub fn new(local: LocalDevice, registry: Arc<DeviceRegistry>, config: MdnsConfig) -> Self {
        Self {
            local,
            registry,
            config,
            daemon: Mutex::new(None),
            registered: Mutex::new(None),
            seen: Arc::new(DashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn service_info(&self, instance_name: &str) -> Result<ServiceInfo, DiscoveryError> {
        let properties = [
            ("id", self.local.id.as_str()),
            ("version", self.local.version.as_str()),
            ("platform", self.local.platform.as_str()),
        ];
        let hostname = format!("{}.local.", self.local.id);
        ServiceInfo::new(
            &self.config.service_type,
            instance_name,
            &hostname,
            "",
            self.local.transfer_port,
            &properties[..],
        )
        .map(ServiceInfo::enable_addr_auto)
        .map_err(|e| DiscoveryError::Mdns(e.to_string()))
    }

    fn register_record(&self, daemon: &ServiceDaemon, name: &str) -> Result<String, DiscoveryError> {
        let info = self.service_info(name)?;
        let fullname = info.get_fullname().to_string();
        daemon
            .register(info)
            .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        Ok(fullname)
    }
}

#[async_trait]
impl Discovery for MdnsDiscovery {
    async fn start(&self) -> Result<(), DiscoveryError> {
        let mut daemon_slot = self.daemon.lock().await;
        if daemon_slot.is_some() {
            return Err(DiscoveryError::InvalidState("already started".to_string()));
        }

        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Mdns(e.to_string()))?;

        let fullname = self.register_record(&daemon, &self.local.current_name())?;
        *self.registered.lock().await = Some(fullname);

        let browser = daemon
            .browse(&self.config.service_type)
            .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        tracing::info!("mDNS discovery browsing {}", self.config.service_type);

        let mut tasks = self.tasks.lock().await;

        // Browser
        {
            let registry = Arc::clone(&self.registry);
            let seen = Arc::clone(&self.seen);
            let local_id = self.local.id.clone();
            tasks.push(tokio::spawn(async move {
                while let Ok(event) = browser.recv_async().await {
                    match event {
                        ServiceEvent::ServiceResolved(info) => {
                            let Some(id) = info.get_property_val_str("id") else {
                                // Records without our metadata are not peers
                                continue;
                            };
                            if id == local_id {
                                continue;
                            }
                            let Some(address) = info.get_addresses().iter().next().copied() else {
                                continue;
                            };
                            seen.insert(info.get_fullname().to_string(), id.to_string());
                            registry.upsert(Observation {
                                id: id.to_string(),
                                name: instance_name(info.get_fullname()),
                                address: IpAddr::from(address),
                                port: info.get_port(),
                                platform: info
                                    .get_property_val_str("platform")
                                    .unwrap_or("unknown")
                                    .to_string(),
                                version: info
                                    .get_property_val_str("version")
                                    .unwrap_or("0.0.0")
                                    .to_string(),
                            });
                        }
                        ServiceEvent::ServiceRemoved(_, fullname) => {
                            if let Some((_, id)) = seen.remove(&fullname) {
                                registry.remove(&id);
                            }
                        }
                        _ => {}
                    }
                }
            }));
        }

        // Delegated staleness sweep
        tasks.push(DeviceRegistry::spawn_sweeper(
            &self.registry,
            self.config.sweep_interval,
            self.config.stale_timeout,
        ));

        *daemon_slot = Some(daemon);
        Ok(())
    }

    async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        drop(tasks);

        if let Some(daemon) = self.daemon.lock().await.take() {
            if let Some(fullname) = self.registered.lock().await.take() {
                if let Err(e) = daemon.unregister(&fullname) {
                    tracing::debug!("mDNS unregister failed: {e}");
                }
            }
            if let Err(e) = daemon.shutdown() {
                tracing::debug!("mDNS shutdown failed: {e}");
            }
        }
        tracing::info!("mDNS discovery stopped");
    }

    fn update_local_name(&self, name: &str) {
        self.local.set_name(name);

        // Republish under the new instance name if we are running.
        let Ok(daemon_slot) = self.daemon.try_lock() else {
            return;
        };
        let Some(daemon) = daemon_slot.as_ref() else {
            return;
        };
        let Ok(mut registered) = self.registered.try_lock() else {
            return;
        };
        if let Some(old) = registered.take() {
            if let Err(e) = daemon.unregister(&old) {
                tracing::debug!("mDNS unregister of {old} failed: {e}");
            }
        }
        match self.register_record(daemon, name) {
            Ok(fullname) => *registered = Some(fullname),
            Err(e) => tracing::warn!("mDNS re-register failed: {e}"),
        }
    }
}

/// Instance portion of a service fullname
/// (`Name._airlift._tcp.local.` -> `Name`).
fn instance_name(fullname: &str) -> String {
    fullname
        .split_once("._")
        .map_or(fullname, |(instance, _)| instance)
        .to_string()
}
