// ── Monitor ──
//
// Wires the cache, fetch engine, and scheduler to the collaborator
// interfaces and drives everything through one message pump. Fetches run
// as spawned tasks and re-enter the pump as `DeviceUpdate` messages;
// deferred synthetic events are published here, strictly after the
// cache released its lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::capstore::CapabilityStore;
use crate::client::{ConfigWriter, DeviceClient, DeviceHandle, DeviceProvider};
use crate::config::MonitorConfig;
use crate::error::CoreError;
use crate::fetch::FetchEngine;
use crate::sched::Scheduler;
use crate::store::{DeviceCache, DeviceUpdate};

const MESSAGE_CHANNEL_SIZE: usize = 256;
const NOTIFY_CHANNEL_SIZE: usize = 64;

/// Messages driving the cache pump.
#[derive(Debug)]
pub enum CacheMessage {
    /// Fetch `current` concurrently; queue the successor waves.
    Wave {
        current: Vec<String>,
        remaining: Vec<Vec<String>>,
    },
    /// A fetch completed.
    DeviceUpdate(DeviceUpdate),
    /// A refresh timer fired for one device.
    DeviceRefresh(String),
    /// The focus debounce window elapsed. The sequence number pins the
    /// message to the focus change that scheduled it.
    FocusDebounce { device: String, seq: u64 },
    /// User-initiated refresh of the whole fleet.
    RefreshAll,
}

/// What the view layer hears about. Rendering (or ignoring) these is its
/// business entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    DeviceUpdated(String),
    AllLoaded,
}

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc`. Owns the cache, the pump task, and the
/// root cancellation token.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    config: Arc<MonitorConfig>,
    cache: Arc<DeviceCache>,
    fetcher: Arc<FetchEngine>,
    scheduler: Scheduler,
    provider: Arc<dyn DeviceProvider>,
    bus: Arc<dyn EventBus>,
    handles: RwLock<BTreeMap<String, DeviceHandle>>,
    msg_tx: mpsc::Sender<CacheMessage>,
    msg_rx: Mutex<Option<mpsc::Receiver<CacheMessage>>>,
    notify_tx: broadcast::Sender<Notification>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Bumped on every focus change; stale debounce messages die on it.
    focus_seq: AtomicU64,
}

impl Monitor {
    /// Assemble a monitor. Does NOT start anything -- call
    /// [`start()`](Self::start) to load the fleet and spawn the pump.
    pub fn new(
        config: MonitorConfig,
        client: Arc<dyn DeviceClient>,
        provider: Arc<dyn DeviceProvider>,
        writer: Arc<dyn ConfigWriter>,
        bus: Arc<dyn EventBus>,
        caps: CapabilityStore,
    ) -> Self {
        let config = Arc::new(config);
        let (msg_tx, msg_rx) = mpsc::channel(MESSAGE_CHANNEL_SIZE);
        let (notify_tx, _) = broadcast::channel(NOTIFY_CHANNEL_SIZE);
        let fetcher = Arc::new(FetchEngine::new(client, caps, writer, &config));

        Self {
            inner: Arc::new(MonitorInner {
                scheduler: Scheduler::new(Arc::clone(&config)),
                config,
                cache: Arc::new(DeviceCache::new()),
                fetcher,
                provider,
                bus,
                handles: RwLock::new(BTreeMap::new()),
                msg_tx,
                msg_rx: Mutex::new(Some(msg_rx)),
                notify_tx,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                focus_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Load the configured fleet and begin the staged initial fetch.
    pub async fn start(&self) -> Result<(), CoreError> {
        let Some(rx) = self.inner.msg_rx.lock().await.take() else {
            return Err(CoreError::AlreadyStarted);
        };

        let devices = self.inner.provider.list_devices();
        if devices.is_empty() {
            return Err(CoreError::EmptyFleet);
        }

        self.inner.cache.init(&devices);
        let order = Scheduler::load_order(&devices);
        *self.inner.handles.write() = devices;

        // Route push events into the cache before the first fetch, so
        // nothing streamed during the initial load is missed.
        self.inner.cache.subscribe_events(&self.inner.bus);

        let mut waves = self.inner.scheduler.plan_waves(order);
        if !waves.is_empty() {
            let current = waves.remove(0);
            let _ = self
                .inner
                .msg_tx
                .send(CacheMessage::Wave {
                    current,
                    remaining: waves,
                })
                .await;
        }

        let inner = Arc::clone(&self.inner);
        self.inner
            .tasks
            .lock()
            .await
            .push(tokio::spawn(pump(inner, rx)));

        info!(devices = self.inner.cache.device_count(), "monitor started");
        Ok(())
    }

    /// Cancel all timers and in-flight fetches, then join the pump.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        debug!("monitor shut down");
    }

    // ── Consumer surface ─────────────────────────────────────────────

    /// The shared read surface.
    pub fn cache(&self) -> &Arc<DeviceCache> {
        &self.inner.cache
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Subscribe to update / all-loaded notifications.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notify_tx.subscribe()
    }

    /// Move (or clear) the focused device.
    ///
    /// The fetch itself fires only after the debounce window passes with
    /// the focus still on the same device, so rapid scrolling collapses
    /// to at most one request per window.
    pub fn set_focus(&self, device: Option<String>) {
        self.inner.cache.set_focused(device.clone());
        let seq = self.inner.focus_seq.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(name) = device {
            self.inner.scheduler.schedule_message(
                self.inner.config.focus_debounce,
                CacheMessage::FocusDebounce { device: name, seq },
                &self.inner.msg_tx,
                &self.inner.cancel,
            );
        }
    }

    /// Queue a fetch for every device.
    pub fn refresh_all(&self) {
        if self.inner.msg_tx.try_send(CacheMessage::RefreshAll).is_err() {
            warn!("message channel full; dropping refresh request");
        }
    }
}

// ── The pump ─────────────────────────────────────────────────────────

async fn pump(inner: Arc<MonitorInner>, mut rx: mpsc::Receiver<CacheMessage>) {
    loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                handle_message(&inner, msg);
            }
        }
    }
}

fn handle_message(inner: &Arc<MonitorInner>, msg: CacheMessage) {
    match msg {
        CacheMessage::Wave { current, remaining } => {
            debug!(devices = current.len(), queued = remaining.len(), "fetch wave");
            for name in &current {
                spawn_fetch(inner, name);
            }
            if !remaining.is_empty() {
                let mut rest = remaining;
                let next = rest.remove(0);
                inner.scheduler.schedule_message(
                    inner.config.wave_delay,
                    CacheMessage::Wave {
                        current: next,
                        remaining: rest,
                    },
                    &inner.msg_tx,
                    &inner.cancel,
                );
            }
        }

        CacheMessage::DeviceUpdate(update) => {
            let device = update.device.clone();
            let outcome = inner.cache.apply_update(update);

            // The lock is released; only now may the synthetic event go
            // out. The bus will call straight back into the cache.
            if let Some(event) = outcome.deferred_event {
                inner.bus.publish(&event);
            }

            if !outcome.accepted {
                return;
            }

            let _ = inner
                .notify_tx
                .send(Notification::DeviceUpdated(device.clone()));
            if outcome.initial_load_complete {
                info!("all devices loaded");
                let _ = inner.notify_tx.send(Notification::AllLoaded);
            }

            if let Some(record) = outcome.record {
                let push_connected = inner.cache.is_push_connected(&device);
                let focused = inner.cache.focused().as_deref() == Some(device.as_str());
                inner.scheduler.schedule_next(
                    &record,
                    push_connected,
                    focused,
                    &inner.msg_tx,
                    &inner.cancel,
                );
            }
        }

        CacheMessage::DeviceRefresh(name) => {
            if inner.cache.is_push_connected(&name) {
                debug!(device = %name, "refresh tick dropped; device streams over push");
                return;
            }
            spawn_fetch(inner, &name);
        }

        CacheMessage::FocusDebounce { device: name, seq } => {
            // Only fetch if the focus has not moved since this message
            // was scheduled; rapid scrolling dies here, one fetch per
            // quiet window survives.
            if seq != inner.focus_seq.load(Ordering::Relaxed)
                || inner.cache.focused().as_deref() != Some(name.as_str())
            {
                return;
            }
            spawn_fetch(inner, &name);

            let missing_extended = inner
                .cache
                .get(&name)
                .is_some_and(|record| record.wifi.is_none() || record.system.is_none());
            if missing_extended {
                spawn_extended_fetch(inner, &name);
            }
        }

        CacheMessage::RefreshAll => {
            debug!("refreshing entire fleet");
            let names: Vec<String> = inner.handles.read().keys().cloned().collect();
            for name in names {
                spawn_fetch(inner, &name);
            }
        }
    }
}

/// Launch one fetch task; its result re-enters the pump.
fn spawn_fetch(inner: &Arc<MonitorInner>, name: &str) {
    let Some(handle) = inner.handles.read().get(name).cloned() else {
        warn!(device = %name, "fetch requested for unconfigured device");
        return;
    };

    let request_id = inner.cache.next_request_id();
    let fetcher = Arc::clone(&inner.fetcher);
    let tx = inner.msg_tx.clone();
    let cancel = inner.cancel.clone();

    tokio::spawn(async move {
        let update = fetcher.fetch(&handle, request_id, &cancel).await;
        if cancel.is_cancelled() {
            return;
        }
        let _ = tx.send(CacheMessage::DeviceUpdate(update)).await;
    });
}

/// Launch the lazy wireless/system fetch for the focused device.
fn spawn_extended_fetch(inner: &Arc<MonitorInner>, name: &str) {
    let Some(handle) = inner.handles.read().get(name).cloned() else {
        return;
    };

    let fetcher = Arc::clone(&inner.fetcher);
    let cache = Arc::clone(&inner.cache);
    let cancel = inner.cancel.clone();
    let name = name.to_owned();

    tokio::spawn(async move {
        let (wifi, system) = fetcher.fetch_extended(&handle, &cancel).await;
        if cancel.is_cancelled() {
            return;
        }
        cache.apply_extended(&name, wifi, system);
    });
}
