//! Device registry: every peer currently visible on the network.
//!
//! Pure in-memory map keyed by device id. Mutations are synchronous with
//! respect to the caller and every change is published on a typed broadcast
//! channel; consumers that lag simply miss events, they never block producers.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default staleness timeout for strategies that delegate sweeping.
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default interval between delegated staleness checks.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A peer device observed on the network.
#[derive(Debug, Clone)]
pub struct Device {
    /// Stable unique identifier
    pub id: String,
    /// Advertised display name
    pub name: String,
    /// Address the device was observed from
    pub address: IpAddr,
    /// TCP port its transfer engine listens on
    pub port: u16,
    /// Operating system family
    pub platform: String,
    /// Application version
    pub version: String,
    /// Monotonic timestamp of the latest observation; strictly increases on
    /// each re-observation
    pub last_seen: Instant,
    /// Whether a certificate is pinned for this device (overlaid by the node)
    pub trusted: bool,
    /// Operator-assigned display override (overlaid by the node)
    pub alias: Option<String>,
}

/// Fields a discovery strategy reports for an observation.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Stable unique identifier
    pub id: String,
    /// Advertised display name
    pub name: String,
    /// Source address of the observation
    pub address: IpAddr,
    /// Advertised transfer port
    pub port: u16,
    /// Operating system family, if advertised
    pub platform: String,
    /// Application version, if advertised
    pub version: String,
}

/// Registry change notifications.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A device appeared or refreshed its presence
    Found(Device),
    /// A device disappeared (explicit removal or staleness)
    Lost(String),
}

/// In-memory device map with typed change events.
pub struct DeviceRegistry {
    devices: DashMap<String, Device>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            devices: DashMap::new(),
            events,
        }
    }

    /// Subscribe to registry changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Insert or refresh a device and emit a found notification.
    ///
    /// `last_seen` strictly increases across re-observations even if the
    /// clock reports the same instant twice.
    pub fn upsert(&self, observation: Observation) {
        let mut entry = self
            .devices
            .entry(observation.id.clone())
            .or_insert_with(|| Device {
                id: observation.id.clone(),
                name: observation.name.clone(),
                address: observation.address,
                port: observation.port,
                platform: observation.platform.clone(),
                version: observation.version.clone(),
                last_seen: Instant::now(),
                trusted: false,
                alias: None,
            });

        let mut now = Instant::now();
        if now <= entry.last_seen {
            now = entry.last_seen + Duration::from_nanos(1);
        }
        entry.name = observation.name;
        entry.address = observation.address;
        entry.port = observation.port;
        entry.platform = observation.platform;
        entry.version = observation.version;
        entry.last_seen = now;

        let device = entry.clone();
        drop(entry);
        let _ = self.events.send(RegistryEvent::Found(device));
    }

    /// Remove a device, emitting a lost notification only if it was present.
    pub fn remove(&self, device_id: &str) -> bool {
        if self.devices.remove(device_id).is_some() {
            let _ = self.events.send(RegistryEvent::Lost(device_id.to_string()));
            true
        } else {
            false
        }
    }

    /// Look up one device.
    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.devices.get(device_id).map(|d| d.clone())
    }

    /// Snapshot of all known devices.
    #[must_use]
    pub fn list(&self) -> Vec<Device> {
        self.devices.iter().map(|d| d.clone()).collect()
    }

    /// Remove every device unseen for longer than `timeout`, emitting a lost
    /// notification for each. Returns the evicted ids.
    pub fn sweep_stale(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .devices
            .iter()
            .filter(|d| now.duration_since(d.last_seen) > timeout)
            .map(|d| d.id.clone())
            .collect();
        for id in &stale {
            tracing::debug!("device {id} timed out");
            self.remove(id);
        }
        stale
    }

    /// Run the registry's own periodic sweep. Used by strategies that
    /// delegate staleness handling rather than running their own.
    pub fn spawn_sweeper(
        registry: &Arc<Self>,
        interval: Duration,
        timeout: Duration,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(registry);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.sweep_stale(timeout);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn observation(id: &str, name: &str) -> Observation {
        Observation {
            id: id.to_string(),
            name: name.to_string(),
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            port: 8765,
            platform: "linux".to_string(),
            version: "0.1.0".to_string(),
        }
    }

    #[test]
    fn upsert_is_keyed_by_id() {
        let registry = DeviceRegistry::new();
        registry.upsert(observation("a", "First"));
        registry.upsert(observation("a", "Renamed"));
        registry.upsert(observation("b", "Other"));

        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.get("a").unwrap().name, "Renamed");
    }

    #[test]
    fn last_seen_strictly_increases() {
        let registry = DeviceRegistry::new();
        registry.upsert(observation("a", "Dev"));
        let first = registry.get("a").unwrap().last_seen;
        registry.upsert(observation("a", "Dev"));
        let second = registry.get("a").unwrap().last_seen;
        assert!(second > first);
    }

    #[test]
    fn remove_emits_lost_only_when_present() {
        let registry = DeviceRegistry::new();
        let mut events = registry.subscribe();
        registry.upsert(observation("a", "Dev"));

        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));

        assert!(matches!(events.try_recv().unwrap(), RegistryEvent::Found(_)));
        match events.try_recv().unwrap() {
            RegistryEvent::Lost(id) => assert_eq!(id, "a"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn sweep_evicts_only_stale() {
        let registry = DeviceRegistry::new();
        registry.upsert(observation("old", "Old"));
        std::thread::sleep(Duration::from_millis(20));
        registry.upsert(observation("new", "New"));

        let evicted = registry.sweep_stale(Duration::from_millis(10));
        assert_eq!(evicted, vec!["old".to_string()]);
        assert!(registry.get("old").is_none());
        assert!(registry.get("new").is_some());
    }
}
