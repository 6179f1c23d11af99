// ── Device registry ──
//
// One readers-writer lock around all shared state. Writers never
// perform I/O, never publish, never sleep while holding it: every
// network call, timer, and bus publish happens outside. The event-bus
// handler re-enters this lock, which is exactly why.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::trace;

use crate::bus::EventBus;
use crate::client::DeviceHandle;
use crate::model::{
    ComponentCounts, ConnectionKind, CoverMotion, DeviceGeneration, DeviceRecord, EventKind,
    MonitorEvent, SystemStatus, WifiStatus,
};
use crate::status::{apply_incremental, apply_parsed, parse_full_status, parse_legacy_status};

use super::reconcile::{DeviceUpdate, ReconcileOutcome, reconcile};

/// Everything behind the lock.
#[derive(Debug, Default)]
pub(crate) struct CacheState {
    pub(crate) devices: HashMap<String, DeviceRecord>,
    /// Sorted display order, preserved across updates.
    pub(crate) order: Vec<String>,
    pub(crate) version: u64,
    /// Devices still awaiting their first update during initial load.
    pub(crate) pending: usize,
    pub(crate) initial_load: bool,
    pub(crate) focused: Option<String>,
    pub(crate) refresh_times: HashMap<String, DateTime<Utc>>,
    /// Reverse index for instant IP remapping across a DHCP handoff.
    pub(crate) mac_to_ip: HashMap<String, String>,
    /// Devices currently under a push subscription.
    pub(crate) ws_connected: HashSet<String>,
}

/// The shared device cache.
///
/// All accessors take the shared lock and return owned copies; mutation
/// happens only through [`apply_update`](Self::apply_update), the event
/// handler, and the focus/extended setters.
pub struct DeviceCache {
    state: RwLock<CacheState>,
    request_counter: AtomicU64,
    version_tx: watch::Sender<u64>,
}

impl DeviceCache {
    pub fn new() -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            state: RwLock::new(CacheState::default()),
            request_counter: AtomicU64::new(0),
            version_tx,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Load the configured device set. Every record starts un-fetched;
    /// the caller issues the first wave.
    pub fn init(&self, handles: &BTreeMap<String, DeviceHandle>) {
        let version = {
            let mut state = self.state.write();
            state.devices.clear();
            state.order.clear();
            for handle in handles.values() {
                state
                    .devices
                    .insert(handle.name.clone(), DeviceRecord::from_handle(handle));
                state.order.push(handle.name.clone());
            }
            state.order.sort_unstable();
            state.pending = state.devices.len();
            state.initial_load = !state.devices.is_empty();
            state.version += 1;
            state.version
        };
        self.version_tx.send_replace(version);
    }

    /// Reserve a request token. Tokens start at 1; 0 means "untokened".
    pub fn next_request_id(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ── Mutation ─────────────────────────────────────────────────────

    /// Run the reconciliation protocol for one arriving update.
    ///
    /// The returned outcome may carry a deferred synthetic event; the
    /// caller MUST publish it only after this method has returned, which
    /// is also when the lock is long gone.
    pub fn apply_update(&self, update: DeviceUpdate) -> ReconcileOutcome {
        let (outcome, version) = {
            let mut state = self.state.write();
            let outcome = reconcile(&mut state, update);
            (outcome, state.version)
        };
        if outcome.accepted {
            self.version_tx.send_replace(version);
        }
        outcome
    }

    /// Apply a bus event to the matching record.
    ///
    /// `connection` is the event's underlying connection kind, queried
    /// from the bus *before* this call -- the cache lock is held inside.
    pub fn handle_event(&self, event: &MonitorEvent, connection: Option<ConnectionKind>) {
        let version = {
            let mut state = self.state.write();
            if !state.devices.contains_key(&event.device) {
                trace!(device = %event.device, "event for unknown device dropped");
                return;
            }

            match &event.kind {
                EventKind::StatusChange {
                    component,
                    id,
                    payload,
                } => {
                    if let Some(record) = state.devices.get_mut(&event.device) {
                        apply_incremental(record, *component, *id, payload);
                    }
                }
                EventKind::FullStatus(payload) => {
                    if let Some(record) = state.devices.get_mut(&event.device) {
                        let parsed = if record.generation == DeviceGeneration::Gen1 {
                            parse_legacy_status(&event.device, payload)
                        } else {
                            let components: BTreeMap<String, serde_json::Value> = payload
                                .as_object()
                                .map(|map| {
                                    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
                                })
                                .unwrap_or_default();
                            parse_full_status(&event.device, &components)
                        };
                        apply_parsed(record, parsed);
                    }
                }
                EventKind::DeviceOnline => {
                    if let Some(record) = state.devices.get_mut(&event.device) {
                        record.online = true;
                        record.error = None;
                        record.updated_at = event.at;
                    }
                    // Mirror the push-connection set while still holding
                    // the lock, so readers never see a half-applied flip.
                    if connection == Some(ConnectionKind::Push) {
                        state.ws_connected.insert(event.device.clone());
                    }
                }
                EventKind::DeviceOffline { reason } => {
                    if let Some(record) = state.devices.get_mut(&event.device) {
                        record.online = false;
                        record.error = Some(reason.clone());
                        record.updated_at = event.at;
                    }
                    state.ws_connected.remove(&event.device);
                }
            }

            state.version += 1;
            state.version
        };
        self.version_tx.send_replace(version);
    }

    /// Register the cache's event handler on the bus.
    ///
    /// The handler resolves the device's connection kind first and only
    /// then takes the cache lock; the bus must never be queried from
    /// inside it.
    pub fn subscribe_events(self: &Arc<Self>, bus: &Arc<dyn EventBus>) {
        let cache = Arc::downgrade(self);
        let bus_handle = Arc::downgrade(bus);
        bus.subscribe(Arc::new(move |event| {
            let Some(cache) = cache.upgrade() else { return };
            let connection = bus_handle
                .upgrade()
                .and_then(|bus| bus.connection_info(&event.device))
                .map(|info| info.kind);
            cache.handle_event(event, connection);
        }));
    }

    /// Merge a lazily-fetched wireless/system pair into the record.
    pub fn apply_extended(
        &self,
        device: &str,
        wifi: Option<WifiStatus>,
        system: Option<SystemStatus>,
    ) {
        let version = {
            let mut state = self.state.write();
            let Some(record) = state.devices.get_mut(device) else {
                return;
            };
            if wifi.is_none() && system.is_none() {
                return;
            }
            if wifi.is_some() {
                record.wifi = wifi;
            }
            if system.is_some() {
                record.system = system;
            }
            state.version += 1;
            state.version
        };
        self.version_tx.send_replace(version);
    }

    pub fn set_focused(&self, device: Option<String>) {
        let version = {
            let mut state = self.state.write();
            if state.focused == device {
                return;
            }
            state.focused = device;
            state.version += 1;
            state.version
        };
        self.version_tx.send_replace(version);
    }

    // ── Read surface ─────────────────────────────────────────────────

    pub fn get(&self, device: &str) -> Option<DeviceRecord> {
        self.state.read().devices.get(device).cloned()
    }

    /// All records in sorted order.
    pub fn get_all(&self) -> Vec<DeviceRecord> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|name| state.devices.get(name).cloned())
            .collect()
    }

    pub fn get_online(&self) -> Vec<DeviceRecord> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|name| state.devices.get(name))
            .filter(|record| record.online)
            .cloned()
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.state.read().devices.len()
    }

    pub fn online_count(&self) -> usize {
        self.state
            .read()
            .devices
            .values()
            .filter(|record| record.online)
            .count()
    }

    /// Sum of aggregate power across online devices.
    pub fn total_power(&self) -> f64 {
        self.state
            .read()
            .devices
            .values()
            .filter(|record| record.online)
            .map(|record| record.power)
            .sum()
    }

    /// Fleet-wide component tallies in one pass, so dashboards pay for
    /// one lock acquisition instead of three.
    pub fn component_counts(&self) -> ComponentCounts {
        let state = self.state.read();
        let mut counts = ComponentCounts::default();
        for record in state.devices.values() {
            for switch in &record.switches {
                if switch.on {
                    counts.switches_on += 1;
                } else {
                    counts.switches_off += 1;
                }
            }
            for light in &record.lights {
                if light.on {
                    counts.lights_on += 1;
                } else {
                    counts.lights_off += 1;
                }
            }
            for cover in &record.covers {
                if cover.motion.is_moving() {
                    counts.covers_moving += 1;
                } else {
                    match cover.motion {
                        CoverMotion::Open => counts.covers_open += 1,
                        CoverMotion::Closed => counts.covers_closed += 1,
                        // A stopped cover counts by its position.
                        _ => {
                            if cover.position.unwrap_or(0.0) > 0.0 {
                                counts.covers_open += 1;
                            } else {
                                counts.covers_closed += 1;
                            }
                        }
                    }
                }
            }
        }
        counts
    }

    /// Whether the first pass over the fleet is still in flight.
    pub fn is_loading(&self) -> bool {
        self.state.read().initial_load
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Await-able view of the version counter.
    pub fn watch_version(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    pub fn ip_by_mac(&self, mac: &str) -> Option<String> {
        self.state.read().mac_to_ip.get(mac).cloned()
    }

    pub fn focused(&self) -> Option<String> {
        self.state.read().focused.clone()
    }

    pub fn is_push_connected(&self, device: &str) -> bool {
        self.state.read().ws_connected.contains(device)
    }

    pub fn last_refresh(&self, device: &str) -> Option<DateTime<Utc>> {
        self.state.read().refresh_times.get(device).copied()
    }
}

impl Default for DeviceCache {
    fn default() -> Self {
        Self::new()
    }
}
