// ── Status parsing and merge ──
//
// Pure translation of raw device payloads (both dialects) into the
// unified record shape, plus the merge rules for full snapshots and
// incremental push deltas. Nothing here performs I/O and nothing here
// returns an error: malformed components are dropped, well-formed
// neighbours still apply.

mod apply;
mod capabilities;
mod parse;

pub use apply::{apply_incremental, apply_parsed};
pub use capabilities::{DeviceCapabilities, detect_capabilities};
pub use parse::{ParsedStatus, component_key, parse_full_status, parse_legacy_status};
