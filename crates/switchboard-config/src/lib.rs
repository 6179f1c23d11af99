//! Device registry shared by the Switchboard binaries.
//!
//! A TOML file of configured devices with an env overlay, loaded through
//! figment, written back atomically. Implements the core's
//! `DeviceProvider` and `ConfigWriter` seams: enumeration for the
//! initial load, persistence for identity fields discovered at runtime.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use switchboard_core::model::DeviceGeneration;
use switchboard_core::{ConfigWriter, DeviceHandle, DeviceIdentityUpdate, DeviceProvider};

// ── Error ────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to serialize registry: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("registry loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML shapes ──────────────────────────────────────────────────────

/// The registry document: one `[devices.<name>]` table per device.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceEntry>,
}

/// One configured device. Only `host` is required; the rest is identity
/// the monitor discovers and writes back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceEntry {
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Model code (the capability-detection key).
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub model_code: Option<String>,
    /// Wire-dialect generation number (`gen` in the file; the bare word
    /// is reserved in Rust 2024).
    #[serde(rename = "gen", skip_serializing_if = "Option::is_none")]
    pub generation: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

// ── Registry ─────────────────────────────────────────────────────────

/// The device registry: in-memory view of the TOML file, with
/// best-effort write-back.
pub struct Registry {
    path: PathBuf,
    file: RwLock<RegistryFile>,
}

impl Registry {
    /// Load the registry from `path`, overlaying `SWITCHBOARD_*`
    /// environment variables. A missing file is an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let file: RegistryFile = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SWITCHBOARD_").split("__"))
            .extract()?;

        debug!(path = %path.display(), devices = file.devices.len(), "registry loaded");
        Ok(Self {
            path,
            file: RwLock::new(file),
        })
    }

    /// The conventional registry location for this platform.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "switchboard")
            .map(|dirs| dirs.config_dir().join("devices.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn device_count(&self) -> usize {
        self.file.read().devices.len()
    }

    /// Write the registry back to disk, atomically.
    pub fn save(&self) -> Result<(), ConfigError> {
        let snapshot = self.file.read().clone();
        self.write_atomic(&snapshot)
    }

    fn write_atomic(&self, file: &RegistryFile) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let encoded = toml::to_string_pretty(file)?;
        let tmp = self.path.with_extension("toml.tmp");
        {
            let mut out = fs::File::create(&tmp)?;
            out.write_all(encoded.as_bytes())?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl DeviceProvider for Registry {
    /// Enumerate the configured devices. The TOML table key is
    /// normalized into the handle's `name`: one stable identifier for
    /// the whole cache.
    fn list_devices(&self) -> BTreeMap<String, DeviceHandle> {
        self.file
            .read()
            .devices
            .iter()
            .map(|(name, entry)| {
                let handle = DeviceHandle {
                    name: name.clone(),
                    address: entry.host.clone(),
                    model: entry.model.clone(),
                    generation: entry
                        .generation
                        .map(DeviceGeneration::from_number)
                        .unwrap_or_default(),
                    mac: entry.mac.clone(),
                    platform: entry.platform.clone(),
                };
                (name.clone(), handle)
            })
            .collect()
    }
}

impl ConfigWriter for Registry {
    /// Persist newly-discovered identity. Only fills fields the registry
    /// does not know yet; a failed write is logged and swallowed.
    fn update_device_info(&self, name: &str, update: DeviceIdentityUpdate) {
        let changed = {
            let mut file = self.file.write();
            let Some(entry) = file.devices.get_mut(name) else {
                warn!(device = %name, "identity update for unconfigured device dropped");
                return;
            };

            let mut changed = false;
            if entry.model.is_none() && update.model.is_some() {
                entry.model = update.model;
                changed = true;
            }
            if entry.model_code.is_none() && update.model_code.is_some() {
                entry.model_code = update.model_code;
                changed = true;
            }
            if entry.generation.is_none() {
                if let Some(number) = update.generation.and_then(DeviceGeneration::number) {
                    entry.generation = Some(number);
                    changed = true;
                }
            }
            if entry.mac.is_none() && update.mac.is_some() {
                entry.mac = update.mac;
                changed = true;
            }
            changed
        };

        if changed {
            if let Err(e) = self.save() {
                warn!(device = %name, error = %e, "failed to persist device identity");
            }
        }
    }
}
