// ── Refresh scheduler ──
//
// Decides when each device is pulled next: adaptive per-state intervals
// with jitter, wave-partitioned initial load, focus debounce, and
// suppression for push-connected devices. Timers are plain cancellable
// sleeper tasks that feed messages back into the monitor's pump.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::client::DeviceHandle;
use crate::config::MonitorConfig;
use crate::model::{DeviceGeneration, DeviceRecord};
use crate::monitor::CacheMessage;

pub struct Scheduler {
    config: Arc<MonitorConfig>,
}

impl Scheduler {
    pub fn new(config: Arc<MonitorConfig>) -> Self {
        Self { config }
    }

    // ── Interval selection ───────────────────────────────────────────

    /// The base pull interval for a device in its current state.
    ///
    /// Focus overrides everything. Devices we know nothing about yet
    /// stay on the eager interval regardless of their offline flag --
    /// the first answers are what settle their real cadence.
    pub fn interval_for(&self, record: &DeviceRecord, focused: bool) -> Duration {
        let profile = &self.config.refresh;
        if focused {
            return profile.focused_boost;
        }
        match record.generation {
            DeviceGeneration::Gen1 => {
                if record.online {
                    profile.gen1_online
                } else {
                    profile.gen1_offline
                }
            }
            _ => {
                if record.online || !record.has_info() {
                    profile.gen2_online
                } else {
                    profile.gen2_offline
                }
            }
        }
    }

    /// Add uniform jitter of up to half the interval, so a fleet that
    /// came up together does not pull in lockstep.
    pub fn jittered(&self, base: Duration) -> Duration {
        let half_ms = u64::try_from((base / 2).as_millis()).unwrap_or(u64::MAX);
        if half_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=half_ms))
    }

    // ── Initial load ─────────────────────────────────────────────────

    /// Order devices for the initial load: RPC-generation and unknown
    /// devices first (they tolerate concurrent requests), then first
    /// generation, lexicographic within each group.
    pub fn load_order(handles: &BTreeMap<String, DeviceHandle>) -> Vec<String> {
        let mut names: Vec<&DeviceHandle> = handles.values().collect();
        names.sort_by_key(|handle| {
            let rank = match handle.generation {
                DeviceGeneration::Gen1 => 1_u8,
                _ => 0,
            };
            (rank, handle.name.clone())
        });
        names.into_iter().map(|handle| handle.name.clone()).collect()
    }

    /// Partition an ordered name list into waves: a slightly larger
    /// first wave for quick feedback, smaller ones after.
    pub fn plan_waves(&self, names: Vec<String>) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut rest = names;
        if rest.is_empty() {
            return waves;
        }

        let first = rest
            .drain(..self.config.first_wave_size.min(rest.len()))
            .collect();
        waves.push(first);

        while !rest.is_empty() {
            let take = self.config.wave_size.max(1).min(rest.len());
            waves.push(rest.drain(..take).collect());
        }
        waves
    }

    // ── Timers ───────────────────────────────────────────────────────

    /// Arm the next refresh tick for a device.
    ///
    /// Returns `false` without arming anything when the device streams
    /// over the push channel -- pull would only duplicate traffic. Pull
    /// resumes on the next event once the subscription drops.
    pub fn schedule_next(
        &self,
        record: &DeviceRecord,
        push_connected: bool,
        focused: bool,
        tx: &mpsc::Sender<CacheMessage>,
        cancel: &CancellationToken,
    ) -> bool {
        if push_connected {
            trace!(device = %record.name, "push-connected; pull suppressed");
            return false;
        }

        let delay = self.jittered(self.interval_for(record, focused));
        trace!(device = %record.name, ?delay, "next refresh armed");
        self.schedule_message(
            delay,
            CacheMessage::DeviceRefresh(record.name.clone()),
            tx,
            cancel,
        );
        true
    }

    /// Deliver `msg` to the pump after `delay`, unless cancelled first.
    pub fn schedule_message(
        &self,
        delay: Duration,
        msg: CacheMessage,
        tx: &mpsc::Sender<CacheMessage>,
        cancel: &CancellationToken,
    ) {
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = tx.send(msg).await;
                }
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(MonitorConfig::default()))
    }

    fn record(generation: DeviceGeneration, online: bool, with_info: bool) -> DeviceRecord {
        let mut record = DeviceRecord::new("dev", "10.0.0.1");
        record.generation = generation;
        record.online = online;
        record.fetched = true;
        if with_info {
            record.firmware = Some("1.0.0".into());
        }
        record
    }

    #[test]
    fn interval_table_matches_profile() {
        let sched = scheduler();

        let cases = [
            (DeviceGeneration::Gen1, true, true, 15),
            (DeviceGeneration::Gen1, false, true, 60),
            (DeviceGeneration::Gen2, true, true, 5),
            (DeviceGeneration::Gen2, false, true, 30),
            (DeviceGeneration::Gen3, true, true, 5),
            (DeviceGeneration::Unknown, true, true, 5),
            // No info yet: stay eager even while offline.
            (DeviceGeneration::Unknown, false, false, 5),
            (DeviceGeneration::Unknown, false, true, 30),
        ];
        for (generation, online, with_info, secs) in cases {
            let r = record(generation, online, with_info);
            assert_eq!(
                sched.interval_for(&r, false),
                Duration::from_secs(secs),
                "{generation:?} online={online} info={with_info}"
            );
        }
    }

    #[test]
    fn focus_overrides_every_state() {
        let sched = scheduler();
        let offline_gen1 = record(DeviceGeneration::Gen1, false, true);
        assert_eq!(
            sched.interval_for(&offline_gen1, true),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn jitter_stays_within_half_interval() {
        let sched = scheduler();
        let base = Duration::from_secs(10);
        for _ in 0..200 {
            let jittered = sched.jittered(base);
            assert!(jittered >= base);
            assert!(jittered <= base + Duration::from_secs(5));
        }
    }

    #[test]
    fn load_order_puts_rpc_and_unknown_first() {
        let mut handles = BTreeMap::new();
        for (name, generation) in [
            ("old-b", DeviceGeneration::Gen1),
            ("new-z", DeviceGeneration::Gen2),
            ("old-a", DeviceGeneration::Gen1),
            ("mystery", DeviceGeneration::Unknown),
            ("new-a", DeviceGeneration::Gen3),
        ] {
            let mut handle = DeviceHandle::new(name, "10.0.0.1");
            handle.generation = generation;
            handles.insert(name.to_owned(), handle);
        }

        let order = Scheduler::load_order(&handles);
        assert_eq!(order, vec!["mystery", "new-a", "new-z", "old-a", "old-b"]);
    }

    #[test]
    fn waves_are_three_then_two() {
        let sched = scheduler();
        let names: Vec<String> = ["a", "b", "c", "d", "e", "f", "g"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();

        let waves = sched.plan_waves(names);
        let sizes: Vec<usize> = waves.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 2, 2]);

        let sched = scheduler();
        assert_eq!(
            sched.plan_waves(vec!["a".into(), "b".into()]),
            vec![vec!["a".to_owned(), "b".to_owned()]]
        );
        assert!(sched.plan_waves(Vec::new()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_message_arrives_after_delay() {
        let sched = scheduler();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        sched.schedule_message(
            Duration::from_millis(300),
            CacheMessage::DeviceRefresh("a".into()),
            &tx,
            &cancel,
        );

        // Nothing lands before the delay elapses.
        tokio::time::sleep(Duration::from_millis(299)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        match rx.try_recv() {
            Ok(CacheMessage::DeviceRefresh(name)) => assert_eq!(name, "a"),
            other => panic!("expected refresh message, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let sched = scheduler();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        sched.schedule_message(
            Duration::from_millis(100),
            CacheMessage::RefreshAll,
            &tx,
            &cancel,
        );
        cancel.cancel();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn push_connected_device_gets_no_timer() {
        let sched = scheduler();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let r = record(DeviceGeneration::Gen2, true, true);

        assert!(!sched.schedule_next(&r, true, false, &tx, &cancel));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }
}
