// ── Cache core ──
//
// The authoritative device registry: one readers-writer lock around the
// device map, a version counter, and the reconciliation protocol that
// merges pull results and push events into it.

mod cache;
mod reconcile;

pub use cache::DeviceCache;
pub use reconcile::{DeviceUpdate, ReconcileOutcome};
