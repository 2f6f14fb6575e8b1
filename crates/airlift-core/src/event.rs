//! Typed event bus.
//!
//! Producers (registry bridge, coordinator) publish onto one broadcast
//! channel; consumers subscribe independently. A consumer that lags drops
//! events rather than blocking producers.

use airlift_discovery::Device;
use tokio::sync::broadcast;

use crate::transfer::TransferSnapshot;

/// Everything the core surfaces outward.
#[derive(Debug, Clone)]
pub enum Event {
    /// A device appeared or refreshed its presence
    DeviceFound(Device),
    /// A device disappeared
    DeviceLost {
        /// Id of the vanished device
        device_id: String,
    },
    /// Transfer state or progress changed
    TransferProgress(TransferSnapshot),
    /// A transfer finished successfully
    TransferComplete(TransferSnapshot),
    /// A transfer failed
    TransferError {
        /// Final snapshot of the failed transfer
        transfer: TransferSnapshot,
        /// The triggering cause
        error: String,
    },
    /// An operator decision is needed for a first-contact device
    VerificationRequired {
        /// Device awaiting confirmation
        device_id: String,
        /// 3-digit code both operators compare
        code: String,
    },
}

/// Broadcast bus carrying [`Event`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with a bounded backlog.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Subscribe to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. Silently dropped when nobody is listening.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(Event::DeviceLost {
            device_id: "gone".to_string(),
        });
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(Event::VerificationRequired {
            device_id: "dev".to_string(),
            code: "123".to_string(),
        });
        match rx.recv().await.unwrap() {
            Event::VerificationRequired { device_id, code } => {
                assert_eq!(device_id, "dev");
                assert_eq!(code, "123");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
