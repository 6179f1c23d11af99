// ── Payload parsing ──
//
// Both dialects land in `ParsedStatus`, the intermediate shape that
// `apply_parsed` merges into a record. The RPC dialect arrives as a map
// of `"<kind>:<id>"` component keys; the legacy dialect is one flat
// document with well-known array names.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::trace;

use crate::model::{
    ComponentKind, CoverMotion, CoverStatus, EnergyMeterReading, InputStatus, LightStatus,
    MonitoringSnapshot, PhaseMeterReading, PowerMeterReading, SwitchStatus, SystemStatus,
    WifiStatus,
};

/// Everything one status document can contribute to a record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedStatus {
    pub switches: Vec<SwitchStatus>,
    pub lights: Vec<LightStatus>,
    pub covers: Vec<CoverStatus>,
    pub inputs: Vec<InputStatus>,

    pub snapshot: Option<MonitoringSnapshot>,

    pub switch_power: BTreeMap<u8, f64>,
    pub light_power: BTreeMap<u8, f64>,
    pub cover_power: BTreeMap<u8, f64>,

    pub power: f64,
    pub voltage: f64,
    pub current: f64,
    pub energy_total: f64,
    pub temperature: f64,

    pub wifi: Option<WifiStatus>,
    pub system: Option<SystemStatus>,

    /// MAC surfaced by the status document itself.
    pub mac: Option<String>,
}

/// Split a component key like `"switch:0"` into kind and id.
///
/// A bare name (`"sys"`) addresses id 0; an unparseable id also falls
/// back to 0.
pub fn component_key(name: &str) -> (ComponentKind, u8) {
    let (kind, id) = match name.split_once(':') {
        Some((kind, id)) => (kind, id.parse().unwrap_or(0)),
        None => (name, 0),
    };
    (kind_from_wire(kind), id)
}

fn kind_from_wire(kind: &str) -> ComponentKind {
    match kind {
        "switch" | "relay" => ComponentKind::Switch,
        "light" => ComponentKind::Light,
        "cover" | "roller" => ComponentKind::Cover,
        "input" => ComponentKind::Input,
        "pm1" => ComponentKind::PowerMeter,
        "em" => ComponentKind::EnergyMeter,
        "em1" => ComponentKind::PhaseMeter,
        "sys" => ComponentKind::System,
        "wifi" => ComponentKind::Wifi,
        _ => ComponentKind::Other,
    }
}

// ── Field helpers ────────────────────────────────────────────────────

fn f64_field(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64)
}

fn u64_field(v: &Value, key: &str) -> Option<u64> {
    v.get(key).and_then(Value::as_u64)
}

fn bool_field(v: &Value, key: &str) -> Option<bool> {
    v.get(key).and_then(Value::as_bool)
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_owned)
}

/// `{"aenergy": {"total": ...}}` and friends.
fn nested_f64(v: &Value, outer: &str, inner: &str) -> Option<f64> {
    v.get(outer).and_then(|o| o.get(inner)).and_then(Value::as_f64)
}

// ── RPC dialect ──────────────────────────────────────────────────────

/// Parse a full RPC status: a map from component key to raw payload.
///
/// Malformed components are dropped silently; everything well-formed
/// still lands in the result.
pub fn parse_full_status(device: &str, components: &BTreeMap<String, Value>) -> ParsedStatus {
    let mut parsed = ParsedStatus::default();
    let mut power_meters = Vec::new();
    let mut energy_meters = Vec::new();
    let mut phase_meters = Vec::new();

    for (key, payload) in components {
        let (kind, id) = component_key(key);
        match kind {
            ComponentKind::Switch => {
                if let Some(switch) = parse_switch(id, payload) {
                    if let Some(power) = switch.power {
                        parsed.switch_power.insert(id, power);
                    }
                    note_temperature(&mut parsed, payload);
                    parsed.switches.push(switch);
                } else {
                    trace!(device, key = %key, "dropping malformed switch payload");
                }
            }
            ComponentKind::Light => {
                if let Some(light) = parse_light(id, payload) {
                    if let Some(power) = light.power {
                        parsed.light_power.insert(id, power);
                    }
                    note_temperature(&mut parsed, payload);
                    parsed.lights.push(light);
                } else {
                    trace!(device, key = %key, "dropping malformed light payload");
                }
            }
            ComponentKind::Cover => {
                if let Some(cover) = parse_cover(id, payload) {
                    if let Some(power) = cover.power {
                        parsed.cover_power.insert(id, power);
                    }
                    note_temperature(&mut parsed, payload);
                    parsed.covers.push(cover);
                } else {
                    trace!(device, key = %key, "dropping malformed cover payload");
                }
            }
            ComponentKind::Input => {
                if let Some(input) = parse_input(id, payload) {
                    parsed.inputs.push(input);
                }
            }
            ComponentKind::PowerMeter => {
                if let Some(meter) = parse_power_meter(id, payload) {
                    power_meters.push(meter);
                } else {
                    trace!(device, key = %key, "dropping malformed power-meter payload");
                }
            }
            ComponentKind::EnergyMeter => {
                if let Some(meter) = parse_energy_meter(id, payload) {
                    energy_meters.push(meter);
                } else {
                    trace!(device, key = %key, "dropping malformed energy-meter payload");
                }
            }
            ComponentKind::PhaseMeter => {
                if let Some(meter) = parse_phase_meter(id, payload) {
                    phase_meters.push(meter);
                } else {
                    trace!(device, key = %key, "dropping malformed phase-meter payload");
                }
            }
            ComponentKind::System => {
                parsed.system = Some(parse_system(payload));
                if parsed.mac.is_none() {
                    parsed.mac = str_field(payload, "mac");
                }
            }
            ComponentKind::Wifi => {
                parsed.wifi = Some(parse_wifi(payload));
            }
            ComponentKind::Other => {
                trace!(device, key = %key, "ignoring unknown component");
            }
        }
    }

    if !(power_meters.is_empty() && energy_meters.is_empty() && phase_meters.is_empty()) {
        parsed.snapshot = Some(MonitoringSnapshot {
            power_meters,
            energy_meters,
            phase_meters,
        });
    }

    finalize(&mut parsed);
    parsed
}

pub(crate) fn parse_switch(id: u8, v: &Value) -> Option<SwitchStatus> {
    let on = bool_field(v, "output")?;
    Some(SwitchStatus {
        id,
        on,
        power: f64_field(v, "apower"),
        voltage: f64_field(v, "voltage"),
        current: f64_field(v, "current"),
        energy_total: nested_f64(v, "aenergy", "total"),
        source: str_field(v, "source"),
    })
}

pub(crate) fn parse_light(id: u8, v: &Value) -> Option<LightStatus> {
    let on = bool_field(v, "output")?;
    Some(LightStatus {
        id,
        on,
        brightness: f64_field(v, "brightness"),
        power: f64_field(v, "apower"),
        energy_total: nested_f64(v, "aenergy", "total"),
    })
}

pub(crate) fn parse_cover(id: u8, v: &Value) -> Option<CoverStatus> {
    let state = str_field(v, "state")?;
    Some(CoverStatus {
        id,
        motion: CoverMotion::from_wire(&state),
        position: f64_field(v, "current_pos"),
        power: f64_field(v, "apower"),
        energy_total: nested_f64(v, "aenergy", "total"),
    })
}

pub(crate) fn parse_input(id: u8, v: &Value) -> Option<InputStatus> {
    if !v.is_object() {
        return None;
    }
    Some(InputStatus {
        id,
        state: bool_field(v, "state"),
        percent: f64_field(v, "percent"),
    })
}

fn parse_power_meter(id: u8, v: &Value) -> Option<PowerMeterReading> {
    let power = f64_field(v, "apower")?;
    Some(PowerMeterReading {
        id,
        power,
        voltage: f64_field(v, "voltage"),
        current: f64_field(v, "current"),
        energy_total: nested_f64(v, "aenergy", "total"),
    })
}

fn parse_energy_meter(id: u8, v: &Value) -> Option<EnergyMeterReading> {
    let total_power = f64_field(v, "total_act_power")?;
    let phase_powers = ["a_act_power", "b_act_power", "c_act_power"]
        .iter()
        .filter_map(|key| f64_field(v, key))
        .collect();
    Some(EnergyMeterReading {
        id,
        total_power,
        phase_powers,
        voltage: f64_field(v, "a_voltage"),
        current: f64_field(v, "total_current"),
        energy_total: None,
    })
}

fn parse_phase_meter(id: u8, v: &Value) -> Option<PhaseMeterReading> {
    let power = f64_field(v, "act_power")?;
    Some(PhaseMeterReading {
        id,
        power,
        voltage: f64_field(v, "voltage"),
        current: f64_field(v, "current"),
        energy_total: nested_f64(v, "aenergy", "total"),
    })
}

pub(crate) fn parse_system(v: &Value) -> SystemStatus {
    SystemStatus {
        uptime_secs: u64_field(v, "uptime"),
        ram_free: u64_field(v, "ram_free"),
        fs_free: u64_field(v, "fs_free"),
        restart_required: bool_field(v, "restart_required").unwrap_or(false),
        update_available: v
            .get("available_updates")
            .and_then(|u| u.get("stable"))
            .and_then(|s| s.get("version"))
            .and_then(Value::as_str)
            .map(str::to_owned),
    }
}

pub(crate) fn parse_wifi(v: &Value) -> WifiStatus {
    WifiStatus {
        connected: str_field(v, "status").is_some_and(|s| s == "got ip")
            || bool_field(v, "connected").unwrap_or(false),
        ssid: str_field(v, "ssid"),
        ip: str_field(v, "sta_ip").or_else(|| str_field(v, "ip")),
        rssi: v.get("rssi").and_then(Value::as_i64),
    }
}

/// Component payloads carry the device temperature as `{"tC": ...}`.
fn note_temperature(parsed: &mut ParsedStatus, v: &Value) {
    if parsed.temperature == 0.0 {
        if let Some(t) = nested_f64(v, "temperature", "tC") {
            parsed.temperature = t;
        }
    }
}

// ── Legacy dialect ───────────────────────────────────────────────────

/// Parse a full legacy status document.
///
/// The legacy layout is one flat object: component arrays (`relays`,
/// `meters`, `emeters`, `lights`, `rollers`, `inputs`), sensor fields,
/// `wifi_sta`, and system fields at the top level. Channel ids are array
/// indices.
pub fn parse_legacy_status(device: &str, status: &Value) -> ParsedStatus {
    let mut parsed = ParsedStatus::default();

    if !status.is_object() {
        trace!(device, "legacy status is not an object");
        return parsed;
    }

    let array = |key: &str| {
        status
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };

    // Relays, with per-channel power lifted from the aligned meter.
    let meters = array("meters");
    for (idx, relay) in array("relays").iter().enumerate() {
        let id = idx as u8;
        let Some(on) = bool_field(relay, "ison") else {
            trace!(device, id, "dropping malformed relay payload");
            continue;
        };
        let power = meters.get(idx).and_then(|m| f64_field(m, "power"));
        if let Some(power) = power {
            parsed.switch_power.insert(id, power);
        }
        parsed.switches.push(SwitchStatus {
            id,
            on,
            power,
            voltage: None,
            current: None,
            // Legacy meters count watt-minutes.
            energy_total: meters
                .get(idx)
                .and_then(|m| f64_field(m, "total"))
                .map(|wmin| wmin / 60.0),
            source: str_field(relay, "source"),
        });
    }

    for (idx, light) in array("lights").iter().enumerate() {
        let id = idx as u8;
        let Some(on) = bool_field(light, "ison") else {
            trace!(device, id, "dropping malformed light payload");
            continue;
        };
        let power = f64_field(light, "power")
            .or_else(|| meters.get(idx).and_then(|m| f64_field(m, "power")));
        if let Some(power) = power {
            parsed.light_power.insert(id, power);
        }
        parsed.lights.push(LightStatus {
            id,
            on,
            brightness: f64_field(light, "brightness"),
            power,
            energy_total: None,
        });
    }

    for (idx, roller) in array("rollers").iter().enumerate() {
        let id = idx as u8;
        let Some(state) = str_field(roller, "state") else {
            trace!(device, id, "dropping malformed roller payload");
            continue;
        };
        let power = f64_field(roller, "power");
        if let Some(power) = power {
            parsed.cover_power.insert(id, power);
        }
        parsed.covers.push(CoverStatus {
            id,
            motion: CoverMotion::from_wire(&state),
            position: f64_field(roller, "current_pos"),
            power,
            energy_total: None,
        });
    }

    for (idx, input) in array("inputs").iter().enumerate() {
        parsed.inputs.push(InputStatus {
            id: idx as u8,
            state: input.get("input").and_then(Value::as_u64).map(|i| i != 0),
            percent: None,
        });
    }

    // Meters become the monitoring snapshot. When relays are present the
    // meters are channel meters; they still belong in the snapshot so
    // meter-only devices and relay devices read uniformly.
    let power_meters: Vec<PowerMeterReading> = meters
        .iter()
        .enumerate()
        .filter_map(|(idx, m)| {
            let power = f64_field(m, "power")?;
            Some(PowerMeterReading {
                id: idx as u8,
                power,
                voltage: None,
                current: None,
                energy_total: f64_field(m, "total").map(|wmin| wmin / 60.0),
            })
        })
        .collect();

    // Legacy three-phase meters arrive one phase per entry.
    let emeters = array("emeters");
    let energy_meters: Vec<EnergyMeterReading> = if emeters.is_empty() {
        Vec::new()
    } else {
        let phase_powers: Vec<f64> = emeters
            .iter()
            .filter_map(|m| f64_field(m, "power"))
            .collect();
        let energy: f64 = emeters.iter().filter_map(|m| f64_field(m, "total")).sum();
        vec![EnergyMeterReading {
            id: 0,
            total_power: phase_powers.iter().sum(),
            phase_powers,
            voltage: emeters.first().and_then(|m| f64_field(m, "voltage")),
            current: None,
            energy_total: (energy > 0.0).then_some(energy),
        }]
    };

    if !(power_meters.is_empty() && energy_meters.is_empty()) {
        parsed.snapshot = Some(MonitoringSnapshot {
            power_meters,
            energy_meters,
            phase_meters: Vec::new(),
        });
    }

    // Sensors: internal temperature first, external probes only as a
    // stand-in when the internal sensor is absent.
    parsed.temperature = f64_field(status, "temperature")
        .or_else(|| nested_f64(status, "tmp", "tC"))
        .unwrap_or(0.0);
    if parsed.temperature == 0.0 {
        if let Some(sensors) = status.get("ext_temperature").and_then(Value::as_object) {
            parsed.temperature = sensors
                .values()
                .find_map(|s| f64_field(s, "tC"))
                .unwrap_or(0.0);
        }
    }

    if let Some(wifi) = status.get("wifi_sta") {
        parsed.wifi = Some(parse_wifi(wifi));
    }

    // Flat system fields.
    parsed.system = Some(SystemStatus {
        uptime_secs: u64_field(status, "uptime"),
        ram_free: u64_field(status, "ram_free"),
        fs_free: u64_field(status, "fs_free"),
        restart_required: false,
        update_available: status
            .get("update")
            .filter(|u| bool_field(u, "has_update").unwrap_or(false))
            .and_then(|u| str_field(u, "new_version")),
    });
    parsed.mac = str_field(status, "mac");

    finalize(&mut parsed);
    parsed
}

// ── Aggregation ──────────────────────────────────────────────────────

/// Derive the scalar aggregates from whatever the document provided.
fn finalize(parsed: &mut ParsedStatus) {
    let map_sum = parsed.switch_power.values().sum::<f64>()
        + parsed.light_power.values().sum::<f64>()
        + parsed.cover_power.values().sum::<f64>();

    let has_maps = !(parsed.switch_power.is_empty()
        && parsed.light_power.is_empty()
        && parsed.cover_power.is_empty());

    if has_maps {
        parsed.power = map_sum;
    } else if let Some(snapshot) = &parsed.snapshot {
        parsed.power = snapshot.total_power();
    }

    parsed.voltage = parsed
        .snapshot
        .as_ref()
        .and_then(|s| {
            s.energy_meters
                .iter()
                .find_map(|m| m.voltage)
                .or_else(|| s.phase_meters.iter().find_map(|m| m.voltage))
                .or_else(|| s.power_meters.iter().find_map(|m| m.voltage))
        })
        .or_else(|| parsed.switches.iter().find_map(|s| s.voltage))
        .unwrap_or(0.0);

    parsed.current = parsed.switches.iter().filter_map(|s| s.current).sum::<f64>()
        + parsed
            .snapshot
            .as_ref()
            .map(|s| {
                s.power_meters
                    .iter()
                    .filter_map(|m| m.current)
                    .sum::<f64>()
                    + s.energy_meters
                        .iter()
                        .filter_map(|m| m.current)
                        .sum::<f64>()
                    + s.phase_meters.iter().filter_map(|m| m.current).sum::<f64>()
            })
            .unwrap_or(0.0);

    parsed.energy_total = parsed
        .switches
        .iter()
        .filter_map(|s| s.energy_total)
        .sum::<f64>()
        + parsed
            .lights
            .iter()
            .filter_map(|l| l.energy_total)
            .sum::<f64>()
        + parsed
            .covers
            .iter()
            .filter_map(|c| c.energy_total)
            .sum::<f64>()
        + parsed
            .snapshot
            .as_ref()
            .map(|s| {
                // Channel meters shadow their relay's counter; avoid double
                // counting by only adding meter energy when no component
                // reported its own.
                if parsed.switches.iter().any(|sw| sw.energy_total.is_some()) {
                    s.energy_meters
                        .iter()
                        .filter_map(|m| m.energy_total)
                        .sum::<f64>()
                } else {
                    s.total_energy()
                }
            })
            .unwrap_or(0.0);
}
