// ── Merge rules ──
//
// `apply_parsed` folds a full status document into a record without
// destroying state the document did not cover. `apply_incremental`
// applies a push delta, where an absent field means "unchanged", never
// "zero".

use serde_json::Value;

use crate::model::{
    ComponentKind, CoverMotion, DeviceRecord, EnergyMeterReading, MonitoringSnapshot,
    PhaseMeterReading, PowerMeterReading, SystemStatus, WifiStatus,
};

use super::parse::ParsedStatus;

/// Merge a parsed full status into the record.
///
/// Component lists and power maps replace only when the new document has
/// entries; aggregates are always overwritten (they are recomputable
/// from a full status); identity fields that are already set stay put.
pub fn apply_parsed(record: &mut DeviceRecord, parsed: ParsedStatus) {
    if !parsed.switches.is_empty() {
        record.switches = parsed.switches;
    }
    if !parsed.lights.is_empty() {
        record.lights = parsed.lights;
    }
    if !parsed.covers.is_empty() {
        record.covers = parsed.covers;
    }
    if !parsed.inputs.is_empty() {
        record.inputs = parsed.inputs;
    }

    if !parsed.switch_power.is_empty() {
        record.switch_power = parsed.switch_power;
    }
    if !parsed.light_power.is_empty() {
        record.light_power = parsed.light_power;
    }
    if !parsed.cover_power.is_empty() {
        record.cover_power = parsed.cover_power;
    }

    if let Some(snapshot) = parsed.snapshot {
        if !snapshot.is_empty() {
            record.snapshot = Some(snapshot);
        }
    }

    record.power = parsed.power;
    record.voltage = parsed.voltage;
    record.current = parsed.current;
    record.energy_total = parsed.energy_total;
    if parsed.temperature != 0.0 {
        record.temperature = parsed.temperature;
    }

    if parsed.wifi.is_some() {
        record.wifi = parsed.wifi;
    }
    if parsed.system.is_some() {
        record.system = parsed.system;
    }

    if record.mac.is_none() {
        record.mac = parsed.mac;
    }

    // A full document re-establishes the aggregate truth.
    record.needs_refresh = false;
}

/// Apply a single-component push delta.
///
/// Power-bearing deltas keep the per-component power map (and therefore
/// the aggregate) accurate. A state change without an accompanying power
/// figure marks the record for refresh -- only a pull can re-establish
/// the aggregate truthfully after that.
pub fn apply_incremental(record: &mut DeviceRecord, kind: ComponentKind, id: u8, payload: &Value) {
    if !payload.is_object() {
        return;
    }

    match kind {
        ComponentKind::Switch => apply_switch_delta(record, id, payload),
        ComponentKind::Light => apply_light_delta(record, id, payload),
        ComponentKind::Cover => apply_cover_delta(record, id, payload),
        ComponentKind::Input => {
            let input = record.input_mut(id);
            if let Some(state) = payload.get("state").and_then(Value::as_bool) {
                input.state = Some(state);
            }
            if let Some(pct) = payload.get("percent").and_then(Value::as_f64) {
                input.percent = Some(pct);
            }
        }
        ComponentKind::PowerMeter => {
            apply_power_meter_delta(record, id, payload);
            record.recompute_power();
        }
        ComponentKind::EnergyMeter => {
            apply_energy_meter_delta(record, id, payload);
            record.recompute_power();
        }
        ComponentKind::PhaseMeter => {
            apply_phase_meter_delta(record, id, payload);
            record.recompute_power();
        }
        ComponentKind::System => {
            let system = record.system.get_or_insert_with(SystemStatus::default);
            if let Some(u) = payload.get("uptime").and_then(Value::as_u64) {
                system.uptime_secs = Some(u);
            }
            if let Some(r) = payload.get("ram_free").and_then(Value::as_u64) {
                system.ram_free = Some(r);
            }
            if let Some(f) = payload.get("fs_free").and_then(Value::as_u64) {
                system.fs_free = Some(f);
            }
            if let Some(r) = payload.get("restart_required").and_then(Value::as_bool) {
                system.restart_required = r;
            }
        }
        ComponentKind::Wifi => {
            let wifi = record.wifi.get_or_insert_with(WifiStatus::default);
            if let Some(status) = payload.get("status").and_then(Value::as_str) {
                wifi.connected = status == "got ip";
            }
            if let Some(ssid) = payload.get("ssid").and_then(Value::as_str) {
                wifi.ssid = Some(ssid.to_owned());
            }
            if let Some(ip) = payload.get("sta_ip").and_then(Value::as_str) {
                wifi.ip = Some(ip.to_owned());
            }
            if let Some(rssi) = payload.get("rssi").and_then(Value::as_i64) {
                wifi.rssi = Some(rssi);
            }
        }
        ComponentKind::Other => {}
    }

    // Component payloads piggyback the device temperature.
    if let Some(t) = payload
        .get("temperature")
        .and_then(|t| t.get("tC"))
        .and_then(Value::as_f64)
    {
        record.temperature = t;
    }
}

fn apply_switch_delta(record: &mut DeviceRecord, id: u8, payload: &Value) {
    let apower = payload.get("apower").and_then(Value::as_f64);
    let state_changed = {
        let switch = record.switch_mut(id);
        let prev_on = switch.on;
        if let Some(on) = payload.get("output").and_then(Value::as_bool) {
            switch.on = on;
        }
        if let Some(v) = payload.get("voltage").and_then(Value::as_f64) {
            switch.voltage = Some(v);
        }
        if let Some(c) = payload.get("current").and_then(Value::as_f64) {
            switch.current = Some(c);
        }
        if let Some(e) = energy_total(payload) {
            switch.energy_total = Some(e);
        }
        if let Some(s) = payload.get("source").and_then(Value::as_str) {
            switch.source = Some(s.to_owned());
        }
        if let Some(power) = apower {
            switch.power = Some(power);
        }
        switch.on != prev_on
    };

    if let Some(power) = apower {
        record.switch_power.insert(id, power);
        record.recompute_power();
    } else if state_changed {
        record.needs_refresh = true;
    }
}

fn apply_light_delta(record: &mut DeviceRecord, id: u8, payload: &Value) {
    let apower = payload.get("apower").and_then(Value::as_f64);
    let state_changed = {
        let light = record.light_mut(id);
        let prev_on = light.on;
        if let Some(on) = payload.get("output").and_then(Value::as_bool) {
            light.on = on;
        }
        if let Some(b) = payload.get("brightness").and_then(Value::as_f64) {
            light.brightness = Some(b);
        }
        if let Some(e) = energy_total(payload) {
            light.energy_total = Some(e);
        }
        if let Some(power) = apower {
            light.power = Some(power);
        }
        light.on != prev_on
    };

    if let Some(power) = apower {
        record.light_power.insert(id, power);
        record.recompute_power();
    } else if state_changed {
        record.needs_refresh = true;
    }
}

fn apply_cover_delta(record: &mut DeviceRecord, id: u8, payload: &Value) {
    let apower = payload.get("apower").and_then(Value::as_f64);
    let state_changed = {
        let cover = record.cover_mut(id);
        let prev_motion = cover.motion;
        if let Some(state) = payload.get("state").and_then(Value::as_str) {
            cover.motion = CoverMotion::from_wire(state);
        }
        if let Some(pos) = payload.get("current_pos").and_then(Value::as_f64) {
            cover.position = Some(pos);
        }
        if let Some(e) = energy_total(payload) {
            cover.energy_total = Some(e);
        }
        if let Some(power) = apower {
            cover.power = Some(power);
        }
        cover.motion != prev_motion
    };

    if let Some(power) = apower {
        record.cover_power.insert(id, power);
        record.recompute_power();
    } else if state_changed {
        record.needs_refresh = true;
    }
}

fn apply_power_meter_delta(record: &mut DeviceRecord, id: u8, payload: &Value) {
    let snapshot = record
        .snapshot
        .get_or_insert_with(MonitoringSnapshot::default);
    let pos = match snapshot.power_meters.iter().position(|m| m.id == id) {
        Some(pos) => pos,
        None => {
            snapshot.power_meters.push(PowerMeterReading {
                id,
                ..PowerMeterReading::default()
            });
            snapshot.power_meters.len() - 1
        }
    };
    let meter = &mut snapshot.power_meters[pos];
    if let Some(p) = payload.get("apower").and_then(Value::as_f64) {
        meter.power = p;
    }
    if let Some(v) = payload.get("voltage").and_then(Value::as_f64) {
        meter.voltage = Some(v);
    }
    if let Some(c) = payload.get("current").and_then(Value::as_f64) {
        meter.current = Some(c);
    }
    if let Some(e) = energy_total(payload) {
        meter.energy_total = Some(e);
    }
}

fn apply_energy_meter_delta(record: &mut DeviceRecord, id: u8, payload: &Value) {
    let snapshot = record
        .snapshot
        .get_or_insert_with(MonitoringSnapshot::default);
    let pos = match snapshot.energy_meters.iter().position(|m| m.id == id) {
        Some(pos) => pos,
        None => {
            snapshot.energy_meters.push(EnergyMeterReading {
                id,
                ..EnergyMeterReading::default()
            });
            snapshot.energy_meters.len() - 1
        }
    };
    let meter = &mut snapshot.energy_meters[pos];
    if let Some(p) = payload.get("total_act_power").and_then(Value::as_f64) {
        meter.total_power = p;
    }
    let phases: Vec<f64> = ["a_act_power", "b_act_power", "c_act_power"]
        .iter()
        .filter_map(|key| payload.get(*key).and_then(Value::as_f64))
        .collect();
    if phases.len() == 3 {
        meter.phase_powers = phases;
    }
    if let Some(c) = payload.get("total_current").and_then(Value::as_f64) {
        meter.current = Some(c);
    }
}

fn apply_phase_meter_delta(record: &mut DeviceRecord, id: u8, payload: &Value) {
    let snapshot = record
        .snapshot
        .get_or_insert_with(MonitoringSnapshot::default);
    let pos = match snapshot.phase_meters.iter().position(|m| m.id == id) {
        Some(pos) => pos,
        None => {
            snapshot.phase_meters.push(PhaseMeterReading {
                id,
                ..PhaseMeterReading::default()
            });
            snapshot.phase_meters.len() - 1
        }
    };
    let meter = &mut snapshot.phase_meters[pos];
    if let Some(p) = payload.get("act_power").and_then(Value::as_f64) {
        meter.power = p;
    }
    if let Some(v) = payload.get("voltage").and_then(Value::as_f64) {
        meter.voltage = Some(v);
    }
    if let Some(c) = payload.get("current").and_then(Value::as_f64) {
        meter.current = Some(c);
    }
}

fn energy_total(payload: &Value) -> Option<f64> {
    payload
        .get("aenergy")
        .and_then(|e| e.get("total"))
        .and_then(Value::as_f64)
}
