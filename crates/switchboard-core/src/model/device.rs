// ── Device domain types ──

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::DeviceHandle;

/// Wire-dialect family of a device.
///
/// Generation 1 speaks the REST dialect; generation 2 and later speak
/// JSON-RPC with an optional streaming push channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceGeneration {
    Gen1,
    Gen2,
    Gen3,
    #[default]
    Unknown,
}

impl DeviceGeneration {
    /// Whether the device speaks the JSON-RPC dialect.
    pub fn is_rpc(self) -> bool {
        matches!(self, Self::Gen2 | Self::Gen3)
    }

    pub fn from_number(n: u8) -> Self {
        match n {
            1 => Self::Gen1,
            2 => Self::Gen2,
            3 => Self::Gen3,
            _ => Self::Unknown,
        }
    }

    pub fn number(self) -> Option<u8> {
        match self {
            Self::Gen1 => Some(1),
            Self::Gen2 => Some(2),
            Self::Gen3 => Some(3),
            Self::Unknown => None,
        }
    }
}

/// Connectivity state derived from the liveness fields of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Created by the initial load; no fetch attempt has completed yet.
    Pending,
    /// Last fetch succeeded.
    Online,
    /// Last fetch failed but a usable prior record is preserved.
    Degraded,
    /// Never successfully fetched, or no usable history remains.
    Offline,
}

// ── Component states ─────────────────────────────────────────────────

/// Relay / switch channel state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwitchStatus {
    pub id: u8,
    pub on: bool,
    /// Active power in watts, when the channel has metering.
    pub power: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    /// Lifetime energy in watt-hours.
    pub energy_total: Option<f64>,
    /// What last actuated the channel (`"http"`, `"button"`, ...).
    pub source: Option<String>,
}

/// Dimmer / bulb channel state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LightStatus {
    pub id: u8,
    pub on: bool,
    /// Brightness percentage (0-100).
    pub brightness: Option<f64>,
    pub power: Option<f64>,
    pub energy_total: Option<f64>,
}

/// Motion state of a cover / roller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoverMotion {
    Open,
    Closed,
    Opening,
    Closing,
    Stopped,
    Calibrating,
    #[default]
    Unknown,
}

impl CoverMotion {
    /// Map a wire state string from either dialect onto the unified enum.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            "closed" | "close" => Self::Closed,
            "opening" => Self::Opening,
            "closing" => Self::Closing,
            "stop" | "stopped" => Self::Stopped,
            "calibrating" => Self::Calibrating,
            _ => Self::Unknown,
        }
    }

    pub fn is_moving(self) -> bool {
        matches!(self, Self::Opening | Self::Closing | Self::Calibrating)
    }
}

/// Cover / roller channel state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverStatus {
    pub id: u8,
    pub motion: CoverMotion,
    /// Position percentage (0 = closed, 100 = open), when calibrated.
    pub position: Option<f64>,
    pub power: Option<f64>,
    pub energy_total: Option<f64>,
}

/// Input terminal state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputStatus {
    pub id: u8,
    /// Logical level for binary inputs.
    pub state: Option<bool>,
    /// Analog inputs report a percentage instead.
    pub percent: Option<f64>,
}

// ── Monitoring snapshot ──────────────────────────────────────────────

/// Single-channel power meter reading (gen-1 `meters`, RPC `pm1`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerMeterReading {
    pub id: u8,
    pub power: f64,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub energy_total: Option<f64>,
}

/// Three-phase energy meter reading (RPC `em`, gen-1 `emeters`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyMeterReading {
    pub id: u8,
    pub total_power: f64,
    /// Per-phase active power, in phase order.
    pub phase_powers: Vec<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub energy_total: Option<f64>,
}

/// Single-phase meter reading (RPC `em1`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseMeterReading {
    pub id: u8,
    pub power: f64,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub energy_total: Option<f64>,
}

/// A bundle of meter readings taken at one instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSnapshot {
    pub power_meters: Vec<PowerMeterReading>,
    pub energy_meters: Vec<EnergyMeterReading>,
    pub phase_meters: Vec<PhaseMeterReading>,
}

impl MonitoringSnapshot {
    pub fn is_empty(&self) -> bool {
        self.power_meters.is_empty() && self.energy_meters.is_empty() && self.phase_meters.is_empty()
    }

    /// Sum of active power across every meter in the snapshot.
    pub fn total_power(&self) -> f64 {
        self.power_meters.iter().map(|m| m.power).sum::<f64>()
            + self.energy_meters.iter().map(|m| m.total_power).sum::<f64>()
            + self.phase_meters.iter().map(|m| m.power).sum::<f64>()
    }

    /// Sum of lifetime energy across meters that report it, in watt-hours.
    pub fn total_energy(&self) -> f64 {
        self.power_meters
            .iter()
            .filter_map(|m| m.energy_total)
            .sum::<f64>()
            + self
                .energy_meters
                .iter()
                .filter_map(|m| m.energy_total)
                .sum::<f64>()
            + self
                .phase_meters
                .iter()
                .filter_map(|m| m.energy_total)
                .sum::<f64>()
    }
}

// ── Extended status ──────────────────────────────────────────────────

/// Wireless link record, fetched lazily for the focused device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiStatus {
    pub connected: bool,
    pub ssid: Option<String>,
    pub ip: Option<String>,
    pub rssi: Option<i64>,
}

/// System record, fetched lazily for the focused device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub uptime_secs: Option<u64>,
    pub ram_free: Option<u64>,
    pub fs_free: Option<u64>,
    pub restart_required: bool,
    pub update_available: Option<String>,
}

// ── Component addressing ─────────────────────────────────────────────

/// Component family, as addressed by status keys and push deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    Switch,
    Light,
    Cover,
    Input,
    PowerMeter,
    EnergyMeter,
    PhaseMeter,
    System,
    Wifi,
    Other,
}

/// Fleet-wide component tallies, gathered in a single pass over the map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComponentCounts {
    pub switches_on: usize,
    pub switches_off: usize,
    pub lights_on: usize,
    pub lights_off: usize,
    pub covers_open: usize,
    pub covers_closed: usize,
    pub covers_moving: usize,
}

// ── The device record ────────────────────────────────────────────────

/// The authoritative per-device record.
///
/// One instance per device name, owned by the cache core and mutated only
/// under its write lock. Pull snapshots and push deltas both land here;
/// the merge rules live in [`crate::status`] and
/// [`crate::store::reconcile`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    // Identity
    pub name: String,
    pub address: String,
    pub mac: Option<String>,
    /// Marketing / display model name.
    pub model: Option<String>,
    /// Model code used for capability detection.
    pub model_code: Option<String>,
    pub generation: DeviceGeneration,
    pub platform: Option<String>,

    // Liveness
    pub online: bool,
    /// At least one fetch attempt has completed (success or failure).
    pub fetched: bool,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub last_request_id: u64,

    // Static info, set once after the first successful fetch
    pub firmware: Option<String>,
    pub app: Option<String>,
    pub auth_enabled: bool,

    // Monitoring
    pub snapshot: Option<MonitoringSnapshot>,

    // Component states, unique by id
    pub switches: Vec<SwitchStatus>,
    pub lights: Vec<LightStatus>,
    pub covers: Vec<CoverStatus>,
    pub inputs: Vec<InputStatus>,

    // Per-component power maps, id -> watts
    pub switch_power: BTreeMap<u8, f64>,
    pub light_power: BTreeMap<u8, f64>,
    pub cover_power: BTreeMap<u8, f64>,

    // Aggregates
    pub power: f64,
    pub voltage: f64,
    pub current: f64,
    pub energy_total: f64,
    pub temperature: f64,

    // Lazy extended status
    pub wifi: Option<WifiStatus>,
    pub system: Option<SystemStatus>,

    /// A push delta changed a component without reporting power; the next
    /// pull must re-establish the aggregate.
    pub needs_refresh: bool,
}

impl DeviceRecord {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            mac: None,
            model: None,
            model_code: None,
            generation: DeviceGeneration::Unknown,
            platform: None,
            online: false,
            fetched: false,
            error: None,
            updated_at: Utc::now(),
            last_request_id: 0,
            firmware: None,
            app: None,
            auth_enabled: false,
            snapshot: None,
            switches: Vec::new(),
            lights: Vec::new(),
            covers: Vec::new(),
            inputs: Vec::new(),
            switch_power: BTreeMap::new(),
            light_power: BTreeMap::new(),
            cover_power: BTreeMap::new(),
            power: 0.0,
            voltage: 0.0,
            current: 0.0,
            energy_total: 0.0,
            temperature: 0.0,
            wifi: None,
            system: None,
            needs_refresh: false,
        }
    }

    /// Seed a record from the persisted identity in the device registry.
    pub fn from_handle(handle: &DeviceHandle) -> Self {
        let mut record = Self::new(handle.name.clone(), handle.address.clone());
        record.model = handle.model.clone();
        record.generation = handle.generation;
        record.mac = handle.mac.clone();
        record.platform = handle.platform.clone();
        record
    }

    /// Static info has been populated by a successful fetch.
    pub fn has_info(&self) -> bool {
        self.firmware.is_some()
    }

    /// Any usable state beyond bare identity survives on this record.
    pub fn has_history(&self) -> bool {
        self.has_info()
            || self.snapshot.is_some()
            || !self.switches.is_empty()
            || !self.lights.is_empty()
            || !self.covers.is_empty()
    }

    pub fn conn_state(&self) -> ConnState {
        if !self.fetched {
            ConnState::Pending
        } else if self.online {
            ConnState::Online
        } else if self.has_history() {
            ConnState::Degraded
        } else {
            ConnState::Offline
        }
    }

    /// Whether any per-component power map has entries.
    pub fn has_power_maps(&self) -> bool {
        !self.switch_power.is_empty()
            || !self.light_power.is_empty()
            || !self.cover_power.is_empty()
    }

    /// Re-derive the aggregate power figure.
    ///
    /// The per-component maps are authoritative whenever they have
    /// entries; meter-only devices fall back to the snapshot sum.
    pub fn recompute_power(&mut self) {
        if self.has_power_maps() {
            self.power = self.switch_power.values().sum::<f64>()
                + self.light_power.values().sum::<f64>()
                + self.cover_power.values().sum::<f64>();
        } else if let Some(snapshot) = &self.snapshot {
            self.power = snapshot.total_power();
        }
    }

    pub(crate) fn switch_mut(&mut self, id: u8) -> &mut SwitchStatus {
        let pos = match self.switches.iter().position(|s| s.id == id) {
            Some(pos) => pos,
            None => {
                self.switches.push(SwitchStatus {
                    id,
                    ..SwitchStatus::default()
                });
                self.switches.len() - 1
            }
        };
        &mut self.switches[pos]
    }

    pub(crate) fn light_mut(&mut self, id: u8) -> &mut LightStatus {
        let pos = match self.lights.iter().position(|l| l.id == id) {
            Some(pos) => pos,
            None => {
                self.lights.push(LightStatus {
                    id,
                    ..LightStatus::default()
                });
                self.lights.len() - 1
            }
        };
        &mut self.lights[pos]
    }

    pub(crate) fn cover_mut(&mut self, id: u8) -> &mut CoverStatus {
        let pos = match self.covers.iter().position(|c| c.id == id) {
            Some(pos) => pos,
            None => {
                self.covers.push(CoverStatus {
                    id,
                    ..CoverStatus::default()
                });
                self.covers.len() - 1
            }
        };
        &mut self.covers[pos]
    }

    pub(crate) fn input_mut(&mut self, id: u8) -> &mut InputStatus {
        let pos = match self.inputs.iter().position(|i| i.id == id) {
            Some(pos) => pos,
            None => {
                self.inputs.push(InputStatus {
                    id,
                    ..InputStatus::default()
                });
                self.inputs.len() - 1
            }
        };
        &mut self.inputs[pos]
    }
}
