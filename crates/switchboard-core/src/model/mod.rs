// ── Domain model ──
//
// The unified device record and the event vocabulary shared by the
// cache, the fetch engine, and the push-channel bridge.

pub mod device;
pub mod event;

pub use device::{
    ComponentCounts, ComponentKind, ConnState, CoverMotion, CoverStatus, DeviceGeneration,
    DeviceRecord, EnergyMeterReading, InputStatus, LightStatus, MonitoringSnapshot,
    PhaseMeterReading, PowerMeterReading, SwitchStatus, SystemStatus, WifiStatus,
};
pub use event::{ConnectionInfo, ConnectionKind, EventKind, MonitorEvent};
