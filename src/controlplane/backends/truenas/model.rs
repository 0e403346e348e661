//! TrueNAS wire model
//!
//! Only the fields the controller reads are modelled; everything else in the
//! appliance's responses is ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A ZFS property as reported by the middleware
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZfsProperty {
    pub parsed: Value,
    pub rawvalue: String,
    pub value: String,
    pub source: String,
}

impl ZfsProperty {
    /// Numeric value in bytes, when the property carries one
    pub fn as_bytes(&self) -> Option<i64> {
        self.parsed
            .as_i64()
            .or_else(|| self.parsed.as_f64().map(|f| f as i64))
            .or_else(|| self.rawvalue.parse().ok())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub pool: String,
    pub mountpoint: Option<String>,
    pub available: ZfsProperty,
    pub refquota: ZfsProperty,
    pub comments: ZfsProperty,
}

impl Dataset {
    /// Mount path on the appliance, `/mnt/<name>` when not reported
    pub fn mount_path(&self) -> String {
        match &self.mountpoint {
            Some(path) if !path.is_empty() => path.clone(),
            _ => format!("/mnt/{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotProperties {
    pub referenced: ZfsProperty,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    /// `dataset@snapshot`
    pub id: String,
    /// `dataset@snapshot`
    pub name: String,
    /// Short name
    pub snapshot_name: String,
    pub dataset: String,
    pub properties: SnapshotProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NfsShare {
    pub id: i64,
    pub path: String,
    pub networks: Vec<String>,
    pub hosts: Vec<String>,
    pub maproot_user: Option<String>,
    pub maproot_group: Option<String>,
    pub mapall_user: Option<String>,
    pub mapall_group: Option<String>,
    pub enabled: bool,
}

/// Asynchronous middleware job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
    pub id: i64,
    pub state: String,
    pub result: Value,
    pub error: Value,
}

// =============================================================================
// Request Payloads
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct DatasetCreate<'a> {
    pub name: &'a str,
    pub refquota: i64,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub comments: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetQuota {
    pub refquota: i64,
}

/// Ownership and mode applied to a fresh dataset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PermissionOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetPermissions<'a> {
    pub path: &'a str,
    #[serde(flatten)]
    pub options: &'a PermissionOptions,
}

/// NFS export options for a fresh dataset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShareOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maproot_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maproot_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapall_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapall_group: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShareCreate<'a> {
    pub path: &'a str,
    #[serde(flatten)]
    pub options: &'a ShareOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotCreate<'a> {
    pub dataset: &'a str,
    pub name: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotClone<'a> {
    pub snapshot: &'a str,
    pub dataset_dst: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotDeleteOptions {
    pub defer: bool,
}

/// Local one-shot replication of one snapshot into another dataset
#[derive(Debug, Clone, Serialize)]
pub struct OneTimeReplication<'a> {
    pub direction: &'static str,
    pub transport: &'static str,
    pub source_datasets: [&'a str; 1],
    pub target_dataset: &'a str,
    pub recursive: bool,
    pub retention_policy: &'static str,
    pub readonly: &'static str,
    pub properties: bool,
    pub name_regex: &'a str,
}

impl<'a> OneTimeReplication<'a> {
    pub fn local(source: &'a str, snapshot_name: &'a str, target: &'a str) -> Self {
        Self {
            direction: "PUSH",
            transport: "LOCAL",
            source_datasets: [source],
            target_dataset: target,
            recursive: false,
            retention_policy: "NONE",
            readonly: "IGNORE",
            properties: false,
            name_regex: snapshot_name,
        }
    }
}
