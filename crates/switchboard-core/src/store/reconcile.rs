// ── Reconciliation protocol ──
//
// Decides how an arriving fetch result lands in the registry: stale
// responses are discarded by token, transient failures degrade the
// record in place instead of wiping usable history, everything else
// merges. The synthetic offline event is a *return value*: the caller
// publishes it only after the write lock is gone, because the bus calls
// straight back into the cache.

use chrono::Utc;
use tracing::debug;

use crate::model::{DeviceRecord, MonitorEvent};

use super::cache::CacheState;

/// Fallback reason when a failed pull carries no error text. Downstream
/// consumers match on this string; keep it stable.
pub(crate) const PULL_FAILED: &str = "pull failed";

/// A fetch result en route to the cache, tagged with its request token.
#[derive(Debug, Clone)]
pub struct DeviceUpdate {
    pub device: String,
    pub record: DeviceRecord,
    pub request_id: u64,
}

/// What a reconciliation pass decided.
///
/// `deferred_event` must be published strictly after the cache lock is
/// released -- encoding it here (rather than as a callback) keeps that
/// discipline visible at the call site.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// False when the update was discarded as stale.
    pub accepted: bool,
    /// Synthetic offline event to publish after unlocking.
    pub deferred_event: Option<MonitorEvent>,
    /// This update completed the initial load.
    pub initial_load_complete: bool,
    /// Post-merge copy of the record, for scheduling decisions.
    pub record: Option<DeviceRecord>,
}

impl ReconcileOutcome {
    fn rejected() -> Self {
        Self::default()
    }
}

/// Apply one update under the write lock. See the module comment for the
/// protocol; the caller owns lock release and event publication.
pub(crate) fn reconcile(state: &mut CacheState, update: DeviceUpdate) -> ReconcileOutcome {
    let DeviceUpdate {
        device,
        record: mut incoming,
        request_id,
    } = update;
    let now = Utc::now();

    let (deferred_event, merged, first_attempt) = match state.devices.get_mut(&device) {
        Some(existing) => {
            // Stale response: an earlier fetch outlived a later one.
            if request_id > 0 && existing.last_request_id > request_id {
                debug!(
                    device = %device,
                    token = request_id,
                    current = existing.last_request_id,
                    "discarding stale update"
                );
                return ReconcileOutcome::rejected();
            }
            let first_attempt = !existing.fetched;

            if incoming.error.is_some() && existing.fetched && existing.has_info() {
                // Transient failure with usable history: degrade in place.
                let was_online = existing.online;
                existing.online = false;
                existing.error = incoming.error.clone();
                existing.updated_at = now;
                existing.last_request_id = existing.last_request_id.max(request_id);

                let deferred = was_online.then(|| {
                    let reason = incoming
                        .error
                        .as_deref()
                        .filter(|text| !text.is_empty())
                        .unwrap_or(PULL_FAILED)
                        .to_owned();
                    MonitorEvent::offline(device.clone(), reason)
                });
                (deferred, existing.clone(), first_attempt)
            } else {
                incoming.fetched = true;
                incoming.updated_at = now;
                incoming.last_request_id = existing.last_request_id.max(request_id);
                carry_over(&mut incoming, existing);
                *existing = incoming;
                (None, existing.clone(), first_attempt)
            }
        }
        None => {
            // Unknown device: admit it (late registry addition). It was
            // never counted into the initial load.
            incoming.fetched = true;
            incoming.updated_at = now;
            incoming.last_request_id = request_id;
            let merged = incoming.clone();
            state.devices.insert(device.clone(), incoming);
            if !state.order.contains(&device) {
                state.order.push(device.clone());
                state.order.sort_unstable();
            }
            (None, merged, false)
        }
    };

    if merged.online {
        if let Some(mac) = &merged.mac {
            state
                .mac_to_ip
                .insert(mac.clone(), merged.address.clone());
        }
    }

    state.refresh_times.insert(device, now);
    state.version += 1;

    // `pending` counts devices that have never completed an attempt; a
    // re-fetch of an already-settled device must not drain it early.
    let mut initial_load_complete = false;
    if first_attempt && state.pending > 0 {
        state.pending -= 1;
        if state.pending == 0 && state.initial_load {
            state.initial_load = false;
            initial_load_complete = true;
        }
    }

    ReconcileOutcome {
        accepted: true,
        deferred_event,
        initial_load_complete,
        record: Some(merged),
    }
}

/// Preserve what an incoming record is missing but the existing one has:
/// the snapshot when the new one is absent or empty, extended records,
/// and identity fields that were already settled.
fn carry_over(incoming: &mut DeviceRecord, existing: &DeviceRecord) {
    let incoming_empty = incoming
        .snapshot
        .as_ref()
        .is_none_or(crate::model::MonitoringSnapshot::is_empty);
    let existing_has = existing
        .snapshot
        .as_ref()
        .is_some_and(|s| !s.is_empty());
    if incoming_empty && existing_has {
        incoming.snapshot = existing.snapshot.clone();
    }

    if incoming.wifi.is_none() {
        incoming.wifi = existing.wifi.clone();
    }
    if incoming.system.is_none() {
        incoming.system = existing.system.clone();
    }

    if incoming.mac.is_none() {
        incoming.mac = existing.mac.clone();
    }
    if incoming.model.is_none() {
        incoming.model = existing.model.clone();
    }
    if incoming.model_code.is_none() {
        incoming.model_code = existing.model_code.clone();
    }
    if incoming.platform.is_none() {
        incoming.platform = existing.platform.clone();
    }
    if incoming.firmware.is_none() {
        incoming.firmware = existing.firmware.clone();
    }
    if incoming.app.is_none() {
        incoming.app = existing.app.clone();
    }
    if incoming.generation == crate::model::DeviceGeneration::Unknown {
        incoming.generation = existing.generation;
    }
}
