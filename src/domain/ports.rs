//! Domain Ports - Core trait definitions for the volume controller
//!
//! These traits define the boundaries between the controller logic and the
//! outside world: wall-clock time and the raw message channel to an
//! appliance. Production adapters live in [`crate::transport`]; tests plug in
//! in-memory doubles.

use crate::transport::{Endpoint, RpcError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Clock Port
// =============================================================================

/// Source of wall-clock time for session bookkeeping
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// =============================================================================
// Wire Channel Port
// =============================================================================

/// A persistent, message-oriented connection to one appliance endpoint
///
/// Implementations carry whole text frames; framing below that (WebSocket,
/// TLS) is their own concern.
#[async_trait]
pub trait WireChannel: Send {
    /// Write one text frame
    async fn send_text(&mut self, frame: String) -> Result<(), RpcError>;

    /// Wait for the next text frame
    async fn recv_text(&mut self) -> Result<String, RpcError>;

    /// Zero-payload keepalive write. An error means the write side is dead.
    async fn ping(&mut self) -> Result<(), RpcError>;

    /// Best-effort close
    async fn close(&mut self);
}

/// Port for opening raw channels to an endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel. `allow_insecure` disables TLS certificate verification.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        allow_insecure: bool,
    ) -> Result<Box<dyn WireChannel>, RpcError>;
}

pub type ConnectorRef = Arc<dyn Connector>;
pub type ClockRef = Arc<dyn Clock>;

// =============================================================================
// Secrets
// =============================================================================

/// Appliance API key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

// =============================================================================
// Volume Policies
// =============================================================================

/// What happens to the backing dataset when a volume is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnDeletePolicy {
    Delete,
    Retain,
    Archive,
}

impl OnDeletePolicy {
    pub const SUPPORTED: [&'static str; 3] = ["delete", "retain", "archive"];

    /// Case-insensitive parse; `None` for unknown values
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("delete") {
            Some(Self::Delete)
        } else if value.eq_ignore_ascii_case("retain") {
            Some(Self::Retain)
        } else if value.eq_ignore_ascii_case("archive") {
            Some(Self::Archive)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OnDeletePolicy::Delete => "delete",
            OnDeletePolicy::Retain => "retain",
            OnDeletePolicy::Archive => "archive",
        }
    }
}

impl std::fmt::Display for OnDeletePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the consumer wants to access the volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    #[default]
    Mount,
    Block,
}

/// Where the initial content of a new volume comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentSource {
    /// Snapshot identifier issued by a previous snapshot-create
    Snapshot(String),
    /// Volume identifier issued by a previous volume-create
    Volume(String),
}

// =============================================================================
// Inbound Requests / Responses
// =============================================================================

/// Request to create a volume
#[derive(Debug, Clone, Default)]
pub struct CreateVolumeRequest {
    /// Platform-assigned volume name (pv name)
    pub name: String,
    /// Requested capacity in bytes
    pub capacity_bytes: i64,
    /// Storage class parameters, keys matched case-insensitively
    pub parameters: BTreeMap<String, String>,
    /// Secrets; must carry `apiKey`
    pub secrets: BTreeMap<String, String>,
    /// Requested access type
    pub access_type: AccessType,
    /// Optional content source
    pub content_source: Option<ContentSource>,
}

/// Result of a volume create
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolumeResponse {
    /// Opaque volume identifier
    pub volume_id: String,
    /// Capacity reported back to the platform
    pub capacity_bytes: i64,
    /// Context handed to the node side (share path, dataset name, ...)
    pub volume_context: BTreeMap<String, String>,
    /// Echo of the content source
    pub content_source: Option<ContentSource>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
    pub secrets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExpandVolumeRequest {
    pub volume_id: String,
    pub capacity_bytes: i64,
    pub secrets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandVolumeResponse {
    /// Quota observed on the dataset after the update; 0 when nothing was done
    pub capacity_bytes: i64,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSnapshotRequest {
    /// Platform-assigned snapshot name
    pub name: String,
    pub source_volume_id: String,
    /// Must be empty
    pub parameters: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSnapshotResponse {
    pub snapshot_id: String,
    pub source_volume_id: String,
    /// Referenced bytes at snapshot time
    pub size_bytes: i64,
    pub creation_time: DateTime<Utc>,
    pub ready_to_use: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteSnapshotRequest {
    pub snapshot_id: String,
    pub secrets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct GetCapacityRequest {
    pub parameters: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityResponse {
    pub available_bytes: i64,
    pub minimum_volume_bytes: i64,
}

/// Observed state of an existing volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub volume_id: String,
    pub dataset: String,
    pub quota_bytes: i64,
    pub available_bytes: i64,
    pub share_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_is_redacted() {
        let key = ApiKey::new("1-abcdef");
        assert_eq!(format!("{}", key), "***");
        assert_eq!(format!("{:?}", key), "ApiKey(***)");
        assert_eq!(key.expose(), "1-abcdef");
    }

    #[test]
    fn test_on_delete_parse() {
        assert_eq!(OnDeletePolicy::parse("Retain"), Some(OnDeletePolicy::Retain));
        assert_eq!(OnDeletePolicy::parse("ARCHIVE"), Some(OnDeletePolicy::Archive));
        assert_eq!(OnDeletePolicy::parse("delete"), Some(OnDeletePolicy::Delete));
        assert_eq!(OnDeletePolicy::parse("shred"), None);
        assert_eq!(format!("{}", OnDeletePolicy::Archive), "archive");
    }
}
