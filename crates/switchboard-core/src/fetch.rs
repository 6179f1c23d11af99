// ── Fetch engine ──
//
// Acquires a full device status: capability lookup, discovery fallback,
// component refresh, monitoring snapshot, aggregation. Every network
// step shares one per-device timeout budget; whatever completed before
// the budget ran out is still a valid (partial) result.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::capstore::{CapKind, CapabilityStore, ComponentInventory};
use crate::client::{ConfigWriter, DeviceClient, DeviceHandle, DeviceIdentityUpdate, DeviceInfo};
use crate::config::MonitorConfig;
use crate::model::{DeviceGeneration, DeviceRecord, SystemStatus, WifiStatus};
use crate::store::DeviceUpdate;

pub struct FetchEngine {
    client: Arc<dyn DeviceClient>,
    caps: CapabilityStore,
    writer: Arc<dyn ConfigWriter>,
    info_ttl: Duration,
    components_ttl: Duration,
}

impl FetchEngine {
    pub fn new(
        client: Arc<dyn DeviceClient>,
        caps: CapabilityStore,
        writer: Arc<dyn ConfigWriter>,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            client,
            caps,
            writer,
            info_ttl: config.device_info_ttl,
            components_ttl: config.components_ttl,
        }
    }

    /// Per-device timeout budget. First-generation devices get the long
    /// budget (single-threaded HTTP stacks), unknown devices a middle
    /// one so dialect fall-back has room.
    fn budget(generation: DeviceGeneration) -> Duration {
        match generation {
            DeviceGeneration::Gen1 => Duration::from_secs(20),
            DeviceGeneration::Gen2 | DeviceGeneration::Gen3 => Duration::from_secs(10),
            DeviceGeneration::Unknown => Duration::from_secs(15),
        }
    }

    /// Acquire a full status for one device.
    ///
    /// Never fails: failures land on the returned record's `error` and
    /// `online` fields, and the cache decides what survives.
    pub async fn fetch(
        &self,
        handle: &DeviceHandle,
        request_id: u64,
        cancel: &CancellationToken,
    ) -> DeviceUpdate {
        let mut record = DeviceRecord::from_handle(handle);
        let budget = Self::budget(handle.generation);

        let run = async {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = self.populate(&mut record, handle, cancel) => {}
            }
        };
        if tokio::time::timeout(budget, run).await.is_err() {
            if record.online {
                debug!(device = %handle.name, "budget exhausted; returning partial result");
            } else if record.error.is_none() {
                record.error = Some(format!("timeout after {}s", budget.as_secs()));
            }
        }

        DeviceUpdate {
            device: handle.name.clone(),
            record,
            request_id,
        }
    }

    /// Fetch the lazy wireless/system records for the focused device.
    pub async fn fetch_extended(
        &self,
        handle: &DeviceHandle,
        cancel: &CancellationToken,
    ) -> (Option<WifiStatus>, Option<SystemStatus>) {
        let budget = Self::budget(handle.generation);
        let run = async {
            let wifi = match self.client.wireless_status(handle, cancel).await {
                Ok(wifi) => Some(wifi),
                Err(e) => {
                    debug!(device = %handle.name, error = %e, "wireless status unavailable");
                    None
                }
            };
            let system = match self.client.system_status(handle, cancel).await {
                Ok(system) => Some(system),
                Err(e) => {
                    debug!(device = %handle.name, error = %e, "system status unavailable");
                    None
                }
            };
            (wifi, system)
        };
        tokio::time::timeout(budget, run).await.unwrap_or((None, None))
    }

    // ── Acquisition steps ────────────────────────────────────────────

    async fn populate(
        &self,
        record: &mut DeviceRecord,
        handle: &DeviceHandle,
        cancel: &CancellationToken,
    ) {
        // Static facts: cached entry first, discovery on a miss.
        let info = match self.caps.get::<DeviceInfo>(&handle.name, CapKind::DeviceInfo) {
            Some(info) => {
                trace!(device = %handle.name, "device info served from capability store");
                info
            }
            None => match self.client.device_info(handle, cancel).await {
                Ok(info) => {
                    self.caps
                        .set(&handle.name, CapKind::DeviceInfo, &info, self.info_ttl);
                    // Discovery reached the device; that alone proves life.
                    record.online = true;
                    info
                }
                Err(e) => {
                    debug!(device = %handle.name, error = %e, "discovery failed");
                    record.online = false;
                    record.error = Some(e.to_string());
                    return;
                }
            },
        };
        self.adopt_info(record, handle, &info);

        // Component states. RPC-generation devices get the inventory
        // dance; legacy devices answer the same list calls from their
        // single status document.
        let mut first_error: Option<String> = None;
        if record.generation.is_rpc() {
            self.refresh_components_rpc(record, handle, cancel, &mut first_error)
                .await;
        } else {
            self.refresh_components(record, handle, cancel, &mut first_error)
                .await;
        }

        // Monitoring snapshot and the scalar aggregates.
        match self.client.monitoring_snapshot(handle, cancel).await {
            Ok(snapshot) => {
                record.online = true;
                if !snapshot.is_empty() {
                    record.snapshot = Some(snapshot);
                }
            }
            Err(e) => {
                debug!(device = %handle.name, error = %e, "monitoring snapshot unavailable");
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
        aggregate(record);

        // Served entirely from cache and every live call failed: that is
        // an unreachable device, not a partial success.
        if !record.online {
            record.error = first_error.or_else(|| Some("unreachable".into()));
        } else {
            record.error = None;
        }
    }

    /// Fold discovered facts into the record and persist identity fields
    /// the registry did not know yet. Skipped as a persistence step when
    /// model, generation, and MAC are all already present.
    fn adopt_info(&self, record: &mut DeviceRecord, handle: &DeviceHandle, info: &DeviceInfo) {
        let already_complete = handle.model.is_some()
            && handle.generation != DeviceGeneration::Unknown
            && handle.mac.is_some();

        let mut update = DeviceIdentityUpdate::default();

        if record.model.is_none() {
            record.model = info.model.clone();
            update.model = info.model.clone();
        }
        if record.model_code.is_none() {
            record.model_code = info.code.clone();
            update.model_code = info.code.clone();
        }
        if record.generation == DeviceGeneration::Unknown
            && info.generation != DeviceGeneration::Unknown
        {
            record.generation = info.generation;
            update.generation = Some(info.generation);
        }
        if record.mac.is_none() {
            record.mac = info.mac.clone();
            update.mac = info.mac.clone();
        }
        if record.platform.is_none() {
            record.platform = info.platform.clone();
        }

        record.firmware = info.firmware.clone();
        record.app = info.app.clone();
        record.auth_enabled = info.auth_enabled;

        if !already_complete && !update.is_empty() {
            self.writer.update_device_info(&record.name, update);
        }
    }

    /// Inventory-aware component refresh for RPC-generation devices.
    async fn refresh_components_rpc(
        &self,
        record: &mut DeviceRecord,
        handle: &DeviceHandle,
        cancel: &CancellationToken,
        first_error: &mut Option<String>,
    ) {
        match self
            .caps
            .get::<ComponentInventory>(&handle.name, CapKind::Components)
        {
            Some(inventory) => {
                // Seed the slices so the record shows every configured
                // channel even if the refresh below only partially lands.
                for id in &inventory.switches {
                    record.switch_mut(*id);
                }
                for id in &inventory.lights {
                    record.light_mut(*id);
                }
                for id in &inventory.covers {
                    record.cover_mut(*id);
                }
                self.refresh_components(record, handle, cancel, first_error)
                    .await;
            }
            None => {
                self.refresh_components(record, handle, cancel, first_error)
                    .await;
                if record.online {
                    let inventory = ComponentInventory {
                        switches: record.switches.iter().map(|s| s.id).collect(),
                        lights: record.lights.iter().map(|l| l.id).collect(),
                        covers: record.covers.iter().map(|c| c.id).collect(),
                    };
                    self.caps.set(
                        &handle.name,
                        CapKind::Components,
                        &inventory,
                        self.components_ttl,
                    );
                }
            }
        }
    }

    /// Refresh current component states through the list operations.
    async fn refresh_components(
        &self,
        record: &mut DeviceRecord,
        handle: &DeviceHandle,
        cancel: &CancellationToken,
        first_error: &mut Option<String>,
    ) {
        match self.client.switch_list(handle, cancel).await {
            Ok(switches) => {
                record.online = true;
                if !switches.is_empty() {
                    record.switch_power = switches
                        .iter()
                        .filter_map(|s| s.power.map(|p| (s.id, p)))
                        .collect();
                    record.switches = switches;
                }
            }
            Err(e) => {
                trace!(device = %handle.name, error = %e, "switch list unavailable");
                first_error.get_or_insert_with(|| e.to_string());
            }
        }

        match self.client.light_list(handle, cancel).await {
            Ok(lights) => {
                record.online = true;
                if !lights.is_empty() {
                    record.light_power = lights
                        .iter()
                        .filter_map(|l| l.power.map(|p| (l.id, p)))
                        .collect();
                    record.lights = lights;
                }
            }
            Err(e) => {
                trace!(device = %handle.name, error = %e, "light list unavailable");
                first_error.get_or_insert_with(|| e.to_string());
            }
        }

        match self.client.cover_list(handle, cancel).await {
            Ok(covers) => {
                record.online = true;
                if !covers.is_empty() {
                    record.cover_power = covers
                        .iter()
                        .filter_map(|c| c.power.map(|p| (c.id, p)))
                        .collect();
                    record.covers = covers;
                }
            }
            Err(e) => {
                trace!(device = %handle.name, error = %e, "cover list unavailable");
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
    }
}

/// Derive the scalar aggregates from the freshly-acquired state.
fn aggregate(record: &mut DeviceRecord) {
    record.recompute_power();

    record.voltage = record
        .snapshot
        .as_ref()
        .and_then(|s| {
            s.energy_meters
                .iter()
                .find_map(|m| m.voltage)
                .or_else(|| s.phase_meters.iter().find_map(|m| m.voltage))
                .or_else(|| s.power_meters.iter().find_map(|m| m.voltage))
        })
        .or_else(|| record.switches.iter().find_map(|s| s.voltage))
        .unwrap_or(0.0);

    record.current = record
        .switches
        .iter()
        .filter_map(|s| s.current)
        .sum::<f64>()
        + record
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

    let component_energy = record
        .switches
        .iter()
        .filter_map(|s| s.energy_total)
        .sum::<f64>()
        + record
            .lights
            .iter()
            .filter_map(|l| l.energy_total)
            .sum::<f64>()
        + record
            .covers
            .iter()
            .filter_map(|c| c.energy_total)
            .sum::<f64>();
    let snapshot_energy = record
        .snapshot
        .as_ref()
        .map(|s| {
            if record.switches.iter().any(|sw| sw.energy_total.is_some()) {
                s.energy_meters
                    .iter()
                    .filter_map(|m| m.energy_total)
                    .sum::<f64>()
            } else {
                s.total_energy()
            }
        })
        .unwrap_or(0.0);
    record.energy_total = component_energy + snapshot_energy;
}
