// ── Event vocabulary ──
//
// Events delivered over the bus: push-channel payloads bridged by the
// transport layer, plus the synthetic connectivity events the cache
// emits itself.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::device::ComponentKind;

/// How a device is currently reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Persistent streaming subscription; events arrive without polling.
    Push,
    /// Periodic pull only.
    Poll,
}

/// Connection descriptor exposed by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub kind: ConnectionKind,
}

/// Payload variants carried by a [`MonitorEvent`].
#[derive(Debug, Clone)]
pub enum EventKind {
    /// Incremental delta for a single component.
    StatusChange {
        component: ComponentKind,
        id: u8,
        payload: Value,
    },
    /// Complete status payload; replaces the polled view wholesale.
    FullStatus(Value),
    DeviceOnline,
    DeviceOffline { reason: String },
}

/// An event on the bus, stamped with its device and arrival time.
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub device: String,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

impl MonitorEvent {
    pub fn new(device: impl Into<String>, kind: EventKind) -> Self {
        Self {
            device: device.into(),
            at: Utc::now(),
            kind,
        }
    }

    pub fn online(device: impl Into<String>) -> Self {
        Self::new(device, EventKind::DeviceOnline)
    }

    pub fn offline(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            device,
            EventKind::DeviceOffline {
                reason: reason.into(),
            },
        )
    }
}
