// switchboard-core: fleet state cache, scheduler, and status reconciliation

pub mod bus;
pub mod capstore;
pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod model;
pub mod monitor;
pub mod sched;
pub mod status;
pub mod store;

pub use error::CoreError;

// Re-export the most commonly used types at the crate root for ergonomics.
pub use bus::{EventBus, EventHandler, InProcessBus};
pub use client::{
    ClientError, ConfigWriter, DeviceClient, DeviceHandle, DeviceIdentityUpdate, DeviceInfo,
    DeviceProvider,
};
pub use config::{MonitorConfig, RefreshProfile};
pub use model::{
    ComponentCounts, ComponentKind, ConnState, ConnectionInfo, ConnectionKind, DeviceGeneration,
    DeviceRecord, EventKind, MonitorEvent,
};
pub use monitor::{Monitor, Notification};
pub use store::DeviceCache;
