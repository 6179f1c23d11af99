// ── Core error types ──
//
// User-facing errors from switchboard-core. Status acquisition failures
// never surface here -- they are recorded on the device record and read
// back through the cache. This enum covers the operations that can
// legitimately refuse to proceed.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("Monitor already started")]
    AlreadyStarted,

    #[error("Monitor is shut down")]
    ShutDown,

    // ── Data errors ──────────────────────────────────────────────────
    #[error("Device not found: {name}")]
    DeviceNotFound { name: String },

    #[error("No devices configured")]
    EmptyFleet,

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}
