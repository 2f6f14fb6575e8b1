//! UDP broadcast discovery strategy.
//!
//! Announces a JSON self-descriptor every 5 seconds to every directed
//! broadcast address computable from the local IPv4 interfaces, listens
//! continuously for peer announcements, and runs its own staleness sweep.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::registry::{DeviceRegistry, Observation};
use crate::{DISCOVERY_PORT, Discovery, DiscoveryError, LocalDevice};

/// Wire form of a presence announcement. `id`, `name` and `port` are
/// required; the rest default so older peers remain visible.
#[derive(Debug, Serialize, Deserialize)]
struct Announcement {
    id: String,
    name: String,
    port: u16,
    #[serde(default = "unknown")]
    platform: String,
    #[serde(default = "zero_version")]
    version: String,
}

fn unknown() -> String {
    "unknown".to_string()
}

fn zero_version() -> String {
    "0.0.0".to_string()
}

/// Tunables for the broadcast strategy.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// UDP port to bind and announce on
    pub port: u16,
    /// Interval between announcements
    pub announce_interval: Duration,
    /// Interval between staleness checks
    pub sweep_interval: Duration,
    /// Age beyond which an unseen device is evicted
    pub stale_timeout: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            port: DISCOVERY_PORT,
            announce_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(10),
            stale_timeout: Duration::from_secs(30),
        }
    }
}

/// The broadcast datagram strategy.
pub struct BroadcastDiscovery {
    local: LocalDevice,
    registry: Arc<DeviceRegistry>,
    config: BroadcastConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BroadcastDiscovery {
    /// Build the strategy over a registry.
    #[must_use]
    pub fn new(local: LocalDevice, registry: Arc<DeviceRegistry>, config: BroadcastConfig) -> Self {
        Self {
            local,
            registry,
            config,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn bind_socket(port: u16) -> Result<UdpSocket, DiscoveryError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        let addr: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        socket.bind(&addr.into())?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

}

/// Directed broadcast address for one interface: `addr | !mask`.
fn directed_broadcast(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

/// Broadcast addresses for every non-loopback IPv4 interface, falling back to
/// the global broadcast address when none resolve.
fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut addresses = Vec::new();
    match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            for interface in interfaces {
                if interface.is_loopback() {
                    continue;
                }
                if let get_if_addrs::IfAddr::V4(v4) = interface.addr {
                    let broadcast = directed_broadcast(v4.ip, v4.netmask);
                    if !addresses.contains(&broadcast) {
                        addresses.push(broadcast);
                    }
                }
            }
        }
        Err(e) => tracing::warn!("interface enumeration failed: {e}"),
    }
    if addresses.is_empty() {
        addresses.push(Ipv4Addr::BROADCAST);
    }
    addresses
}

#[async_trait]
impl Discovery for BroadcastDiscovery {
    async fn start(&self) -> Result<(), DiscoveryError> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Err(DiscoveryError::InvalidState("already started".to_string()));
        }

        let socket = Arc::new(Self::bind_socket(self.config.port)?);
        tracing::info!("broadcast discovery listening on udp/{}", self.config.port);

        // Announcer
        {
            let socket = Arc::clone(&socket);
            let local = self.local.clone();
            let port = self.config.port;
            let interval = self.config.announce_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let announcement = Announcement {
                        id: local.id.clone(),
                        name: local.current_name(),
                        port: local.transfer_port,
                        platform: local.platform.clone(),
                        version: local.version.clone(),
                    };
                    let payload = match serde_json::to_vec(&announcement) {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::error!("failed to encode announcement: {e}");
                            continue;
                        }
                    };
                    for address in broadcast_addresses() {
                        let target = SocketAddr::new(IpAddr::V4(address), port);
                        if let Err(e) = socket.send_to(&payload, target).await {
                            tracing::debug!("broadcast to {target} failed: {e}");
                        }
                    }
                }
            }));
        }

        // Listener
        {
            let socket = Arc::clone(&socket);
            let registry = Arc::clone(&self.registry);
            let local_id = self.local.id.clone();
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 2048];
                loop {
                    let (len, src) = match socket.recv_from(&mut buf).await {
                        Ok(received) => received,
                        Err(e) => {
                            tracing::warn!("discovery receive error: {e}");
                            continue;
                        }
                    };
                    let announcement: Announcement = match serde_json::from_slice(&buf[..len]) {
                        Ok(a) => a,
                        // Malformed datagrams are expected on a shared port
                        Err(_) => continue,
                    };
                    if announcement.id.is_empty() || announcement.id == local_id {
                        continue;
                    }
                    registry.upsert(Observation {
                        id: announcement.id,
                        name: announcement.name,
                        address: src.ip(),
                        port: announcement.port,
                        platform: announcement.platform,
                        version: announcement.version,
                    });
                }
            }));
        }

        // Staleness sweep
        {
            let registry = Arc::clone(&self.registry);
            let interval = self.config.sweep_interval;
            let timeout = self.config.stale_timeout;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    registry.sweep_stale(timeout);
                }
            }));
        }

        Ok(())
    }

    async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        tracing::info!("broadcast discovery stopped");
    }

    fn update_local_name(&self, name: &str) {
        // Picked up by the announcer on its next tick.
        self.local.set_name(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directed_broadcast_from_addr_and_mask() {
        assert_eq!(
            directed_broadcast(Ipv4Addr::new(192, 168, 1, 20), Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            directed_broadcast(Ipv4Addr::new(10, 4, 17, 9), Ipv4Addr::new(255, 255, 0, 0)),
            Ipv4Addr::new(10, 4, 255, 255)
        );
    }

    #[test]
    fn announcement_requires_core_fields() {
        let err = serde_json::from_str::<Announcement>(r#"{"name":"x","port":1}"#);
        assert!(err.is_err());

        let ok: Announcement =
            serde_json::from_str(r#"{"id":"abc","name":"x","port":8765}"#).unwrap();
        assert_eq!(ok.platform, "unknown");
        assert_eq!(ok.version, "0.0.0");
    }

    #[tokio::test]
    async fn malformed_datagrams_are_ignored() {
        let registry = Arc::new(DeviceRegistry::new());
        let config = BroadcastConfig {
            port: 0,
            ..BroadcastConfig::default()
        };
        let local = LocalDevice::new("self-id", "Me", "linux", "0.1.0", 8765);
        let discovery = BroadcastDiscovery::new(local, Arc::clone(&registry), config);

        // Start binds port 0; nothing should arrive, and nothing should panic.
        discovery.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.list().is_empty());
        discovery.stop().await;
    }
}
