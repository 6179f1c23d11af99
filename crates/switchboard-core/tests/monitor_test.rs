// End-to-end monitor scenarios over a scripted device client and the
// in-process bus, on a paused clock.

#![allow(clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use switchboard_core::capstore::CapabilityStore;
use switchboard_core::model::{
    DeviceGeneration, LightStatus, MonitorEvent, MonitoringSnapshot, PowerMeterReading,
    SwitchStatus, SystemStatus, WifiStatus,
};
use switchboard_core::{
    ClientError, ConfigWriter, ConnectionInfo, ConnectionKind, DeviceClient, DeviceHandle,
    DeviceIdentityUpdate, DeviceInfo, DeviceProvider, EventBus, EventKind, InProcessBus, Monitor,
    MonitorConfig, Notification,
};

// ── Test doubles ─────────────────────────────────────────────────────

#[derive(Clone)]
enum Mode {
    Ok,
    Fail,
    Hang,
}

#[derive(Clone)]
struct DeviceSim {
    info: DeviceInfo,
    switches: Vec<SwitchStatus>,
    snapshot: MonitoringSnapshot,
    mode: Mode,
}

impl DeviceSim {
    fn gen2_plug(power: f64) -> Self {
        Self {
            info: DeviceInfo {
                model: Some("Plus Plug S".into()),
                code: Some("SNPL-00112EU".into()),
                mac: Some("A8032ABCDEF0".into()),
                generation: DeviceGeneration::Gen2,
                firmware: Some("1.4.4".into()),
                ..DeviceInfo::default()
            },
            switches: vec![SwitchStatus {
                id: 0,
                on: true,
                power: Some(power),
                ..SwitchStatus::default()
            }],
            snapshot: MonitoringSnapshot {
                power_meters: vec![PowerMeterReading {
                    id: 0,
                    power,
                    ..PowerMeterReading::default()
                }],
                ..MonitoringSnapshot::default()
            },
            mode: Mode::Ok,
        }
    }
}

struct FleetClient {
    sims: Mutex<HashMap<String, DeviceSim>>,
    calls: Mutex<Vec<(String, &'static str)>>,
}

impl FleetClient {
    fn new(sims: &[(&str, DeviceSim)]) -> Arc<Self> {
        Arc::new(Self {
            sims: Mutex::new(
                sims.iter()
                    .map(|(name, sim)| ((*name).to_owned(), sim.clone()))
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn set_mode(&self, device: &str, mode: Mode) {
        if let Some(sim) = self.sims.lock().unwrap().get_mut(device) {
            sim.mode = mode;
        }
    }

    fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn calls_for(&self, device: &str, op: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, call)| name == device && *call == op)
            .count()
    }

    fn any_calls_for(&self, device: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == device)
            .count()
    }

    /// Record the call, then resolve per the device's scripted mode.
    async fn gate(&self, device: &str, op: &'static str) -> Result<DeviceSim, ClientError> {
        let sim = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((device.to_owned(), op));
            self.sims.lock().unwrap().get(device).cloned()
        };
        let Some(sim) = sim else {
            return Err(ClientError::Connect {
                message: "unknown device".into(),
            });
        };
        match sim.mode {
            Mode::Ok => Ok(sim),
            Mode::Fail => Err(ClientError::Timeout { timeout_secs: 10 }),
            Mode::Hang => {
                // Outlives every budget; the per-device timeout wins.
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ClientError::Timeout { timeout_secs: 3600 })
            }
        }
    }
}

#[async_trait]
impl DeviceClient for FleetClient {
    async fn device_info(
        &self,
        handle: &DeviceHandle,
        _cancel: &CancellationToken,
    ) -> Result<DeviceInfo, ClientError> {
        self.gate(&handle.name, "device_info").await.map(|s| s.info)
    }

    async fn switch_list(
        &self,
        handle: &DeviceHandle,
        _cancel: &CancellationToken,
    ) -> Result<Vec<SwitchStatus>, ClientError> {
        self.gate(&handle.name, "switch_list")
            .await
            .map(|s| s.switches)
    }

    async fn light_list(
        &self,
        handle: &DeviceHandle,
        _cancel: &CancellationToken,
    ) -> Result<Vec<LightStatus>, ClientError> {
        self.gate(&handle.name, "light_list").await.map(|_| Vec::new())
    }

    async fn cover_list(
        &self,
        handle: &DeviceHandle,
        _cancel: &CancellationToken,
    ) -> Result<Vec<switchboard_core::model::CoverStatus>, ClientError> {
        self.gate(&handle.name, "cover_list").await.map(|_| Vec::new())
    }

    async fn monitoring_snapshot(
        &self,
        handle: &DeviceHandle,
        _cancel: &CancellationToken,
    ) -> Result<MonitoringSnapshot, ClientError> {
        self.gate(&handle.name, "monitoring_snapshot")
            .await
            .map(|s| s.snapshot)
    }

    async fn wireless_status(
        &self,
        handle: &DeviceHandle,
        _cancel: &CancellationToken,
    ) -> Result<WifiStatus, ClientError> {
        self.gate(&handle.name, "wireless_status").await.map(|_| WifiStatus {
            connected: true,
            ssid: Some("attic".into()),
            ..WifiStatus::default()
        })
    }

    async fn system_status(
        &self,
        handle: &DeviceHandle,
        _cancel: &CancellationToken,
    ) -> Result<SystemStatus, ClientError> {
        self.gate(&handle.name, "system_status")
            .await
            .map(|_| SystemStatus::default())
    }
}

struct StaticProvider {
    handles: BTreeMap<String, DeviceHandle>,
}

impl DeviceProvider for StaticProvider {
    fn list_devices(&self) -> BTreeMap<String, DeviceHandle> {
        self.handles.clone()
    }
}

struct NullWriter;

impl ConfigWriter for NullWriter {
    fn update_device_info(&self, _name: &str, _update: DeviceIdentityUpdate) {}
}

// ── Harness ──────────────────────────────────────────────────────────

struct Fixture {
    monitor: Monitor,
    client: Arc<FleetClient>,
    bus: Arc<InProcessBus>,
    _capdir: tempfile::TempDir,
}

fn handle(name: &str, address: &str, generation: DeviceGeneration) -> DeviceHandle {
    let mut handle = DeviceHandle::new(name, address);
    handle.generation = generation;
    handle
}

fn fixture(devices: Vec<DeviceHandle>, client: Arc<FleetClient>) -> Fixture {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let capdir = tempfile::tempdir().unwrap();
    let bus = Arc::new(InProcessBus::new());
    let provider = StaticProvider {
        handles: devices
            .into_iter()
            .map(|handle| (handle.name.clone(), handle))
            .collect(),
    };

    let monitor = Monitor::new(
        MonitorConfig::default(),
        Arc::clone(&client) as Arc<dyn DeviceClient>,
        Arc::new(provider),
        Arc::new(NullWriter),
        Arc::clone(&bus) as Arc<dyn EventBus>,
        CapabilityStore::new(capdir.path()),
    );

    Fixture {
        monitor,
        client,
        bus,
        _capdir: capdir,
    }
}

async fn wait_for_all_loaded(rx: &mut tokio::sync::broadcast::Receiver<Notification>) {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            if rx.recv().await.unwrap() == Notification::AllLoaded {
                break;
            }
        }
    })
    .await
    .expect("initial load never completed");
}

async fn wait_for_device_update(
    rx: &mut tokio::sync::broadcast::Receiver<Notification>,
    device: &str,
) {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            if rx.recv().await.unwrap() == Notification::DeviceUpdated(device.to_owned()) {
                break;
            }
        }
    })
    .await
    .expect("device update never arrived");
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn initial_load_with_one_dead_device() {
    let client = FleetClient::new(&[
        ("a", DeviceSim::gen2_plug(10.0)),
        ("b", DeviceSim::gen2_plug(20.0)),
        (
            "c",
            DeviceSim {
                mode: Mode::Hang,
                ..DeviceSim::gen2_plug(0.0)
            },
        ),
    ]);
    let fx = fixture(
        vec![
            handle("a", "10.0.0.1", DeviceGeneration::Gen2),
            handle("b", "10.0.0.2", DeviceGeneration::Gen2),
            handle("c", "10.0.0.3", DeviceGeneration::Gen1),
        ],
        client,
    );

    let mut notifications = fx.monitor.notifications();
    fx.monitor.start().await.unwrap();
    wait_for_all_loaded(&mut notifications).await;

    let cache = fx.monitor.cache();
    assert_eq!(cache.device_count(), 3);
    assert_eq!(cache.online_count(), 2);
    assert!(!cache.is_loading());

    let c = cache.get("c").unwrap();
    assert!(!c.online);
    assert!(c.fetched);
    assert!(c.error.as_deref().unwrap().contains("timeout"));

    // Initial load bump plus one per device.
    assert!(cache.version() >= 4);
    assert!((cache.total_power() - 30.0).abs() < 1e-9);

    fx.monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failure_degrades_and_emits_one_offline() {
    let client = FleetClient::new(&[("a", DeviceSim::gen2_plug(100.0))]);
    let fx = fixture(vec![handle("a", "10.0.0.1", DeviceGeneration::Gen2)], client);

    // Probe subscriber: count synthetic offline events.
    let offline_events: Arc<Mutex<Vec<MonitorEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&offline_events);
    fx.bus.subscribe(Arc::new(move |event| {
        if matches!(event.kind, EventKind::DeviceOffline { .. }) {
            sink.lock().unwrap().push(event.clone());
        }
    }));

    let mut notifications = fx.monitor.notifications();
    fx.monitor.start().await.unwrap();
    wait_for_all_loaded(&mut notifications).await;

    let before = fx.monitor.cache().get("a").unwrap();
    assert!(before.online);
    assert!(
        (before.snapshot.as_ref().unwrap().power_meters[0].power - 100.0).abs() < 1e-9
    );

    // The device stops answering; the next scheduled pull degrades it.
    fx.client.set_mode("a", Mode::Fail);
    wait_for_device_update(&mut notifications, "a").await;

    let after = fx.monitor.cache().get("a").unwrap();
    assert!(!after.online);
    assert!(after.error.as_deref().unwrap().contains("timed out"));
    // History preserved: snapshot, components, identity.
    assert!(
        (after.snapshot.as_ref().unwrap().power_meters[0].power - 100.0).abs() < 1e-9
    );
    assert_eq!(after.switches.len(), 1);
    assert_eq!(after.firmware.as_deref(), Some("1.4.4"));
    assert_eq!(offline_events.lock().unwrap().len(), 1);

    // A second failing pull stays degraded without a second event.
    wait_for_device_update(&mut notifications, "a").await;
    assert_eq!(offline_events.lock().unwrap().len(), 1);

    fx.monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn push_connected_device_is_never_pulled() {
    let client = FleetClient::new(&[("a", DeviceSim::gen2_plug(5.0))]);
    let fx = fixture(vec![handle("a", "10.0.0.1", DeviceGeneration::Gen2)], client);

    let mut notifications = fx.monitor.notifications();
    fx.monitor.start().await.unwrap();
    wait_for_all_loaded(&mut notifications).await;

    // The push channel comes up: connection registered, online event in.
    fx.bus.set_connection(
        "a",
        Some(ConnectionInfo {
            kind: ConnectionKind::Push,
        }),
    );
    fx.bus.publish(&MonitorEvent::online("a"));
    assert!(fx.monitor.cache().is_push_connected("a"));

    // Any timer armed before the push join fires into a drop; nothing
    // reaches the device for a long stretch of virtual time.
    fx.client.clear_calls();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(fx.client.any_calls_for("a"), 0);

    fx.monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn focus_debounce_collapses_rapid_scrolling() {
    let client = FleetClient::new(&[
        ("a", DeviceSim::gen2_plug(1.0)),
        ("b", DeviceSim::gen2_plug(2.0)),
    ]);
    let fx = fixture(
        vec![
            handle("a", "10.0.0.1", DeviceGeneration::Gen2),
            handle("b", "10.0.0.2", DeviceGeneration::Gen2),
        ],
        client,
    );

    let mut notifications = fx.monitor.notifications();
    fx.monitor.start().await.unwrap();
    wait_for_all_loaded(&mut notifications).await;
    fx.client.clear_calls();

    // Scroll a -> b -> a within the 250 ms debounce window.
    fx.monitor.set_focus(Some("a".into()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    fx.monitor.set_focus(Some("b".into()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    fx.monitor.set_focus(Some("a".into()));

    // Let the surviving debounce window elapse and the fetch land.
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(fx.client.calls_for("a", "switch_list"), 1);
    assert_eq!(fx.client.calls_for("b", "switch_list"), 0);
    // The focused device also gets its lazy extended status.
    assert_eq!(fx.client.calls_for("a", "wireless_status"), 1);

    fx.monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn refresh_all_fetches_every_device() {
    let client = FleetClient::new(&[
        ("a", DeviceSim::gen2_plug(1.0)),
        ("b", DeviceSim::gen2_plug(2.0)),
    ]);
    let fx = fixture(
        vec![
            handle("a", "10.0.0.1", DeviceGeneration::Gen2),
            handle("b", "10.0.0.2", DeviceGeneration::Gen2),
        ],
        client,
    );

    let mut notifications = fx.monitor.notifications();
    fx.monitor.start().await.unwrap();
    wait_for_all_loaded(&mut notifications).await;
    fx.client.clear_calls();

    fx.monitor.refresh_all();
    wait_for_device_update(&mut notifications, "a").await;
    wait_for_device_update(&mut notifications, "b").await;

    assert!(fx.client.calls_for("a", "monitoring_snapshot") >= 1);
    assert!(fx.client.calls_for("b", "monitoring_snapshot") >= 1);

    fx.monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn push_events_mutate_records_between_pulls() {
    let client = FleetClient::new(&[("a", DeviceSim::gen2_plug(10.0))]);
    let fx = fixture(vec![handle("a", "10.0.0.1", DeviceGeneration::Gen2)], client);

    let mut notifications = fx.monitor.notifications();
    fx.monitor.start().await.unwrap();
    wait_for_all_loaded(&mut notifications).await;

    let before = fx.monitor.cache().version();
    fx.bus.publish(&MonitorEvent::new(
        "a",
        EventKind::StatusChange {
            component: switchboard_core::ComponentKind::Switch,
            id: 0,
            payload: serde_json::json!({"output": false, "apower": 0.0}),
        },
    ));

    let record = fx.monitor.cache().get("a").unwrap();
    assert!(!record.switches[0].on);
    assert!(record.power.abs() < 1e-9);
    assert!(fx.monitor.cache().version() > before);

    fx.monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn empty_fleet_refuses_to_start() {
    let client = FleetClient::new(&[]);
    let fx = fixture(Vec::new(), client);
    assert!(fx.monitor.start().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_all_polling() {
    let client = FleetClient::new(&[("a", DeviceSim::gen2_plug(1.0))]);
    let fx = fixture(vec![handle("a", "10.0.0.1", DeviceGeneration::Gen2)], client);

    let mut notifications = fx.monitor.notifications();
    fx.monitor.start().await.unwrap();
    wait_for_all_loaded(&mut notifications).await;

    fx.monitor.shutdown().await;
    fx.client.clear_calls();

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(fx.client.any_calls_for("a"), 0);
}
