// ── Capability store ──
//
// File-backed cache of static per-device facts, so discovery is skipped
// for a day at a time. One file per (device, kind). `get` never fails --
// absent, expired, unreadable, and unrecognised entries all read as a
// miss. `set` is best effort. Writes go through a temp file and a
// rename, so a reader never observes a torn entry.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Current on-disk entry schema. Bump when the envelope shape changes;
/// readers treat unknown versions as a miss.
const SCHEMA_VERSION: u32 = 1;

/// The kinds of facts the store persists, each with its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapKind {
    DeviceInfo,
    Components,
}

impl CapKind {
    fn file_tag(self) -> &'static str {
        match self {
            Self::DeviceInfo => "info",
            Self::Components => "components",
        }
    }
}

/// Component inventory persisted for RPC-generation devices: the set of
/// channel ids present per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInventory {
    pub switches: Vec<u8>,
    pub lights: Vec<u8>,
    pub covers: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    /// Unix seconds at write time.
    created_at: u64,
    ttl_secs: u64,
    schema: u32,
    payload: Value,
}

/// File-backed store rooted at an injected directory.
///
/// The root arrives by injection so tests can point the store at a
/// temporary directory instead of a process-global path.
#[derive(Debug, Clone)]
pub struct CapabilityStore {
    root: PathBuf,
}

impl CapabilityStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read an entry. Returns `None` when the entry is absent, expired,
    /// unreadable, carries an unknown schema, or fails to decode.
    pub fn get<T: DeserializeOwned>(&self, device: &str, kind: CapKind) -> Option<T> {
        let path = self.entry_path(device, kind);
        let raw = fs::read(&path).ok()?;
        let envelope: Envelope = serde_json::from_slice(&raw).ok()?;

        if envelope.schema != SCHEMA_VERSION {
            debug!(
                device,
                schema = envelope.schema,
                "capability entry has unknown schema; treating as miss"
            );
            return None;
        }

        let now = unix_now();
        if now.saturating_sub(envelope.created_at) > envelope.ttl_secs {
            debug!(device, kind = kind.file_tag(), "capability entry expired");
            return None;
        }

        serde_json::from_value(envelope.payload).ok()
    }

    /// Write an entry. Failure is logged, never propagated.
    pub fn set<T: Serialize>(&self, device: &str, kind: CapKind, value: &T, ttl: Duration) {
        let payload = match serde_json::to_value(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(device, error = %e, "failed to encode capability entry");
                return;
            }
        };
        let envelope = Envelope {
            created_at: unix_now(),
            ttl_secs: ttl.as_secs(),
            schema: SCHEMA_VERSION,
            payload,
        };

        if let Err(e) = self.write_atomic(device, kind, &envelope) {
            warn!(device, error = %e, "failed to persist capability entry");
        }
    }

    fn write_atomic(&self, device: &str, kind: CapKind, envelope: &Envelope) -> std::io::Result<()> {
        fs::create_dir_all(&self.root)?;
        let path = self.entry_path(device, kind);
        let tmp = path.with_extension("json.tmp");

        let encoded = serde_json::to_vec_pretty(envelope)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)
    }

    fn entry_path(&self, device: &str, kind: CapKind) -> PathBuf {
        self.root
            .join(format!("{}-{}.json", sanitize(device), kind.file_tag()))
    }
}

/// Map a device name onto a safe file-name fragment.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
