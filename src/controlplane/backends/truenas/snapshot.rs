//! Snapshot operations

use super::{
    internal, single, Snapshot, SnapshotClone, SnapshotCreate, SnapshotDeleteOptions, TrueNasApi,
    NOT_FOUND_REASONS,
};
use crate::error::{Code, Result};
use crate::transport::BackendFault;
use serde_json::{json, Value};
use tracing::{debug, info};

pub const CREATE: &str = "zfs.snapshot.create";
pub const DELETE: &str = "zfs.snapshot.delete";
pub const CLONE: &str = "zfs.snapshot.clone";
pub const QUERY: &str = "zfs.snapshot.query";

pub fn classify_create(fault: &BackendFault) -> Code {
    if fault.reason_contains(&["already exists"]) {
        Code::AlreadyExists
    } else if fault.reason_contains(&NOT_FOUND_REASONS) {
        Code::NotFound
    } else {
        Code::Internal
    }
}

/// `None` means the snapshot is already gone
pub fn classify_delete(fault: &BackendFault) -> Option<Code> {
    if fault.reason_contains(&NOT_FOUND_REASONS) {
        None
    } else {
        Some(Code::Internal)
    }
}

pub fn classify_clone(fault: &BackendFault) -> Code {
    if fault.reason_contains(&["already exists"]) {
        Code::AlreadyExists
    } else {
        Code::Internal
    }
}

impl<'s> TrueNasApi<'s> {
    /// Snapshot `dataset` as `dataset@name`
    pub async fn create_snapshot(&self, dataset: &str, name: &str) -> Result<Snapshot> {
        info!(dataset = %dataset, snapshot = %name, "Creating snapshot");
        let params = single(SnapshotCreate { dataset, name })?;
        self.invoke(CREATE, params, classify_create).await
    }

    /// Delete `dataset@name`. Absent snapshots are fine.
    pub async fn delete_snapshot(&self, full_name: &str) -> Result<()> {
        info!(snapshot = %full_name, "Deleting snapshot");
        let _: Option<Value> = self
            .invoke_idempotent(DELETE, json!([full_name]), classify_delete)
            .await?;
        Ok(())
    }

    /// Delete `dataset@name`, or mark it for destruction once its last clone is gone
    pub async fn delete_snapshot_deferred(&self, full_name: &str) -> Result<()> {
        info!(snapshot = %full_name, "Deleting snapshot, deferred while cloned");
        let params = json!([full_name, SnapshotDeleteOptions { defer: true }]);
        let _: Option<Value> = self
            .invoke_idempotent(DELETE, params, classify_delete)
            .await?;
        Ok(())
    }

    /// Clone a snapshot into a new dataset
    pub async fn clone_snapshot(&self, snapshot: &str, dataset_dst: &str) -> Result<()> {
        info!(snapshot = %snapshot, target = %dataset_dst, "Cloning snapshot");
        let params = single(SnapshotClone {
            snapshot,
            dataset_dst,
        })?;
        let _: Value = self.invoke(CLONE, params, classify_clone).await?;
        Ok(())
    }

    /// Snapshots of one dataset
    pub async fn list_snapshots(&self, dataset: &str) -> Result<Vec<Snapshot>> {
        debug!(dataset = %dataset, "Listing snapshots");
        let filters = json!([[["dataset", "=", dataset]]]);
        self.invoke(QUERY, filters, internal).await
    }
}
