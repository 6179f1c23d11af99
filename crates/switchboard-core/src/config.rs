// ── Monitor tuning knobs ──
//
// These types describe *how* the cache refreshes the fleet: pull
// intervals, wave sizing, debounce windows, capability-cache TTLs.
// The embedding binary constructs a `MonitorConfig` and hands it in --
// core never reads config files.

use std::time::Duration;

/// Per-state pull intervals.
///
/// First-generation devices are polled gently -- their single-threaded
/// HTTP stacks drop concurrent requests. RPC-generation devices tolerate
/// a much tighter loop. Unknown-generation devices use the RPC intervals
/// until discovery settles the question.
#[derive(Debug, Clone)]
pub struct RefreshProfile {
    /// Pull interval for online first-generation devices.
    pub gen1_online: Duration,
    /// Pull interval for offline first-generation devices.
    pub gen1_offline: Duration,
    /// Pull interval for online RPC-generation (and unknown) devices.
    pub gen2_online: Duration,
    /// Pull interval for offline RPC-generation (and unknown) devices.
    pub gen2_offline: Duration,
    /// Pull interval for the focused device. Overrides all of the above.
    pub focused_boost: Duration,
}

impl Default for RefreshProfile {
    fn default() -> Self {
        Self {
            gen1_online: Duration::from_secs(15),
            gen1_offline: Duration::from_secs(60),
            gen2_online: Duration::from_secs(5),
            gen2_offline: Duration::from_secs(30),
            focused_boost: Duration::from_secs(3),
        }
    }
}

/// Configuration for the device cache and its scheduler.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Pull interval profile.
    pub refresh: RefreshProfile,
    /// Quiet window before a focus change triggers a fetch.
    pub focus_debounce: Duration,
    /// Devices in the first initial-load wave.
    pub first_wave_size: usize,
    /// Devices in each subsequent initial-load wave.
    pub wave_size: usize,
    /// Delay between initial-load waves.
    pub wave_delay: Duration,
    /// Capability-store TTL for device-info entries.
    pub device_info_ttl: Duration,
    /// Capability-store TTL for component-inventory entries.
    pub components_ttl: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            refresh: RefreshProfile::default(),
            focus_debounce: Duration::from_millis(250),
            first_wave_size: 3,
            wave_size: 2,
            wave_delay: Duration::from_millis(300),
            device_info_ttl: Duration::from_secs(24 * 60 * 60),
            components_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}
