//! # Airlift Discovery
//!
//! Presence discovery for Airlift devices.
//!
//! This crate provides:
//! - The device registry: known peers, staleness sweeps, typed change events
//! - Two interchangeable discovery strategies behind one trait:
//!   UDP broadcast datagrams and mDNS service advertisement
//!
//! Both strategies feed the same registry and exclude the local device from
//! their own observations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broadcast;
pub mod mdns;
pub mod registry;

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

pub use broadcast::{BroadcastConfig, BroadcastDiscovery};
pub use mdns::{MdnsConfig, MdnsDiscovery};
pub use registry::{Device, DeviceRegistry, Observation, RegistryEvent};

/// UDP port for broadcast presence datagrams.
pub const DISCOVERY_PORT: u16 = 8766;

/// mDNS service type for the service-advertisement strategy.
pub const SERVICE_TYPE: &str = "_airlift._tcp.local.";

/// Discovery failures.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Socket setup or send/receive failure
    #[error("discovery I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// mDNS daemon failure
    #[error("mDNS error: {0}")]
    Mdns(String),

    /// Strategy already running or not started
    #[error("invalid discovery state: {0}")]
    InvalidState(String),
}

/// What the local device advertises about itself.
#[derive(Debug, Clone)]
pub struct LocalDevice {
    /// Stable device id
    pub id: String,
    /// Display name, shared and mutable so renames take effect on the next
    /// announce cycle without a restart
    pub name: Arc<RwLock<String>>,
    /// Operating system family
    pub platform: String,
    /// Application version
    pub version: String,
    /// TCP port the transfer engine listens on
    pub transfer_port: u16,
}

impl LocalDevice {
    /// Build the local descriptor.
    #[must_use]
    pub fn new(id: &str, name: &str, platform: &str, version: &str, transfer_port: u16) -> Self {
        Self {
            id: id.to_string(),
            name: Arc::new(RwLock::new(name.to_string())),
            platform: platform.to_string(),
            version: version.to_string(),
            transfer_port,
        }
    }

    /// Current display name.
    #[must_use]
    pub fn current_name(&self) -> String {
        self.name.read().expect("local name lock poisoned").clone()
    }

    /// Replace the display name.
    pub fn set_name(&self, name: &str) {
        *self.name.write().expect("local name lock poisoned") = name.to_string();
    }
}

/// A presence discovery strategy.
///
/// Implementations advertise the local device, observe peers into the
/// registry, and tolerate malformed input without crashing.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Start advertising and observing.
    async fn start(&self) -> Result<(), DiscoveryError>;

    /// Stop all background activity.
    async fn stop(&self);

    /// Change the advertised display name.
    fn update_local_name(&self, name: &str);
}
