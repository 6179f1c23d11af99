// ── Collaborator interfaces ──
//
// The wire-protocol clients, the device registry, and the config writer
// all live outside this crate. The fetch engine and monitor consume them
// through these traits; tests supply scripted doubles.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model::{
    CoverStatus, DeviceGeneration, LightStatus, MonitoringSnapshot, SwitchStatus, SystemStatus,
    WifiStatus,
};

// ── Errors ───────────────────────────────────────────────────────────

/// Failure modes of the wire clients, folded onto device records by the
/// fetch engine. The cache itself never propagates these.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("cannot reach device: {message}")]
    Connect { message: String },

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("device requires authentication")]
    AuthRequired,

    #[error("operation not supported by this device: {operation}")]
    NotSupported { operation: &'static str },

    #[error("request cancelled")]
    Cancelled,
}

impl ClientError {
    /// Whether retrying on the next tick is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Connect { .. })
    }
}

// ── Identity types ───────────────────────────────────────────────────

/// Persisted identity of a configured device, as enumerated by the
/// registry. `name` is the stable key throughout the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub name: String,
    /// Current network location (host or host:port).
    pub address: String,
    pub model: Option<String>,
    pub generation: DeviceGeneration,
    pub mac: Option<String>,
    pub platform: Option<String>,
}

impl DeviceHandle {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            model: None,
            generation: DeviceGeneration::Unknown,
            mac: None,
            platform: None,
        }
    }
}

/// Static facts discovered from a device, persisted in the capability
/// store so re-discovery is skipped for a day at a time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device-reported name, when set by the owner.
    pub name: Option<String>,
    /// Marketing / display model name.
    pub model: Option<String>,
    /// Model code, the key into capability detection.
    pub code: Option<String>,
    pub mac: Option<String>,
    pub generation: DeviceGeneration,
    pub firmware: Option<String>,
    /// Application identifier reported by RPC-generation firmware.
    pub app: Option<String>,
    pub platform: Option<String>,
    pub auth_enabled: bool,
}

/// Newly-discovered identity fields to persist back into the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentityUpdate {
    pub model: Option<String>,
    pub model_code: Option<String>,
    pub generation: Option<DeviceGeneration>,
    pub mac: Option<String>,
}

impl DeviceIdentityUpdate {
    pub fn is_empty(&self) -> bool {
        self.model.is_none()
            && self.model_code.is_none()
            && self.generation.is_none()
            && self.mac.is_none()
    }
}

// ── Traits ───────────────────────────────────────────────────────────

/// Enumerates the configured device set with persisted identity.
pub trait DeviceProvider: Send + Sync {
    fn list_devices(&self) -> BTreeMap<String, DeviceHandle>;
}

/// Persists newly-discovered identity fields. Best effort -- a failed
/// write is the implementation's problem, not the fetch engine's.
pub trait ConfigWriter: Send + Sync {
    fn update_device_info(&self, name: &str, update: DeviceIdentityUpdate);
}

/// The dialect-agnostic device client consumed by the fetch engine.
///
/// Implementations speak REST to first-generation devices and JSON-RPC to
/// the rest; every operation honors the supplied cancellation token and
/// returns promptly once it fires.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Discover static facts, auto-detecting the dialect if unknown.
    async fn device_info(
        &self,
        handle: &DeviceHandle,
        cancel: &CancellationToken,
    ) -> Result<DeviceInfo, ClientError>;

    async fn switch_list(
        &self,
        handle: &DeviceHandle,
        cancel: &CancellationToken,
    ) -> Result<Vec<SwitchStatus>, ClientError>;

    async fn light_list(
        &self,
        handle: &DeviceHandle,
        cancel: &CancellationToken,
    ) -> Result<Vec<LightStatus>, ClientError>;

    async fn cover_list(
        &self,
        handle: &DeviceHandle,
        cancel: &CancellationToken,
    ) -> Result<Vec<CoverStatus>, ClientError>;

    async fn monitoring_snapshot(
        &self,
        handle: &DeviceHandle,
        cancel: &CancellationToken,
    ) -> Result<MonitoringSnapshot, ClientError>;

    async fn wireless_status(
        &self,
        handle: &DeviceHandle,
        cancel: &CancellationToken,
    ) -> Result<WifiStatus, ClientError>;

    async fn system_status(
        &self,
        handle: &DeviceHandle,
        cancel: &CancellationToken,
    ) -> Result<SystemStatus, ClientError>;
}
