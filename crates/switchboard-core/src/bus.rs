// ── Event bus ──
//
// Synchronous publish/subscribe between the push-channel transport, the
// cache, and any other interested component. Publish runs subscribers on
// the caller's stack and may re-enter the publisher -- nobody may hold a
// lock that a subscriber also takes while calling `publish`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::model::{ConnectionInfo, MonitorEvent};

/// A subscriber callback. Invoked synchronously, possibly reentrantly.
pub type EventHandler = Arc<dyn Fn(&MonitorEvent) + Send + Sync>;

/// The bus interface the cache consumes.
///
/// The transport layer owns the concrete bus; the cache only subscribes,
/// publishes its synthetic connectivity events, and asks how each device
/// is currently connected.
pub trait EventBus: Send + Sync {
    fn subscribe(&self, handler: EventHandler);

    /// Deliver an event to every subscriber, synchronously.
    fn publish(&self, event: &MonitorEvent);

    fn connection_info(&self, device: &str) -> Option<ConnectionInfo>;

    fn all_connection_info(&self) -> HashMap<String, ConnectionInfo>;
}

/// In-process reference bus.
///
/// The handler list is cloned out before delivery, so a subscriber may
/// publish (or subscribe) from inside its callback without deadlocking
/// the bus itself.
#[derive(Default)]
pub struct InProcessBus {
    handlers: Mutex<Vec<EventHandler>>,
    connections: RwLock<HashMap<String, ConnectionInfo>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or clear) the connection kind for a device. Called by the
    /// transport layer as push subscriptions come and go.
    pub fn set_connection(&self, device: impl Into<String>, info: Option<ConnectionInfo>) {
        let device = device.into();
        let mut connections = self.connections.write();
        match info {
            Some(info) => {
                connections.insert(device, info);
            }
            None => {
                connections.remove(&device);
            }
        }
    }
}

impl EventBus for InProcessBus {
    fn subscribe(&self, handler: EventHandler) {
        self.handlers.lock().push(handler);
    }

    fn publish(&self, event: &MonitorEvent) {
        let handlers: Vec<EventHandler> = self.handlers.lock().clone();
        for handler in handlers {
            handler(event);
        }
    }

    fn connection_info(&self, device: &str) -> Option<ConnectionInfo> {
        self.connections.read().get(device).copied()
    }

    fn all_connection_info(&self) -> HashMap<String, ConnectionInfo> {
        self.connections.read().clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::model::{ConnectionKind, MonitorEvent};

    #[test]
    fn publish_reaches_all_subscribers() {
        let bus = InProcessBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            bus.subscribe(Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }

        bus.publish(&MonitorEvent::online("plug"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn reentrant_publish_does_not_deadlock() {
        let bus = Arc::new(InProcessBus::new());
        let depth = Arc::new(AtomicUsize::new(0));

        let inner_bus = Arc::clone(&bus);
        let inner_depth = Arc::clone(&depth);
        bus.subscribe(Arc::new(move |event| {
            if inner_depth.fetch_add(1, Ordering::SeqCst) == 0 {
                // First delivery republishes from inside the handler.
                inner_bus.publish(&MonitorEvent::offline(event.device.clone(), "test"));
            }
        }));

        bus.publish(&MonitorEvent::online("plug"));
        assert_eq!(depth.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn connection_info_tracks_set_and_clear() {
        let bus = InProcessBus::new();
        assert!(bus.connection_info("plug").is_none());

        bus.set_connection(
            "plug",
            Some(ConnectionInfo {
                kind: ConnectionKind::Push,
            }),
        );
        assert_eq!(
            bus.connection_info("plug").map(|i| i.kind),
            Some(ConnectionKind::Push)
        );
        assert_eq!(bus.all_connection_info().len(), 1);

        bus.set_connection("plug", None);
        assert!(bus.connection_info("plug").is_none());
    }
}
