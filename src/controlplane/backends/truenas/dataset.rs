//! Dataset operations

use super::{internal, single, Dataset, DatasetCreate, DatasetQuota, PermissionOptions, SetPermissions};
use super::{TrueNasApi, NOT_FOUND_REASONS};
use crate::error::{Code, Result};
use crate::transport::BackendFault;
use serde_json::{json, Value};
use tracing::{debug, info};

pub const CREATE: &str = "pool.dataset.create";
pub const GET: &str = "pool.dataset.get_instance";
pub const UPDATE: &str = "pool.dataset.update";
pub const PROMOTE: &str = "pool.dataset.promote";
pub const DELETE: &str = "pool.dataset.delete";
pub const DESTROY_SNAPSHOTS: &str = "pool.dataset.destroy_snapshots";
pub const SET_PERMISSIONS: &str = "filesystem.setperm";

/// Smallest non-zero quota the appliance accepts
pub const MINIMUM_DATASET_SIZE: i64 = 1 << 30;

// =============================================================================
// Failure Classification
// =============================================================================

pub fn classify_create(fault: &BackendFault) -> Code {
    if fault.reason_contains(&["should be greater than"]) {
        Code::InvalidArgument
    } else if fault.reason_contains(&["already exists"]) {
        Code::AlreadyExists
    } else {
        Code::Internal
    }
}

pub fn classify_get(fault: &BackendFault) -> Code {
    if fault.reason_contains(&["does not exist"]) {
        Code::NotFound
    } else {
        Code::Internal
    }
}

pub fn classify_update(fault: &BackendFault) -> Code {
    if fault.reason_contains(&["does not exist"]) {
        Code::NotFound
    } else if fault.reason_contains(&["should be greater than", "quota"]) {
        Code::InvalidArgument
    } else {
        Code::Internal
    }
}

/// `None` means the dataset is already gone
pub fn classify_delete(fault: &BackendFault) -> Option<Code> {
    if fault.reason_contains(&["has children"]) {
        Some(Code::FailedPrecondition)
    } else if fault.reason_contains(&NOT_FOUND_REASONS) {
        None
    } else {
        Some(Code::Internal)
    }
}

pub fn classify_destroy_snapshots(fault: &BackendFault) -> Option<Code> {
    if fault.reason_contains(&NOT_FOUND_REASONS) {
        None
    } else {
        Some(Code::Internal)
    }
}

// =============================================================================
// Operations
// =============================================================================

impl<'s> TrueNasApi<'s> {
    /// Create a filesystem dataset with a reference quota
    pub async fn create_dataset(&self, name: &str, refquota: i64, comments: &str) -> Result<Dataset> {
        info!(dataset = %name, refquota, "Creating dataset");
        let params = single(DatasetCreate {
            name,
            refquota,
            kind: "FILESYSTEM",
            comments,
        })?;
        self.invoke(CREATE, params, classify_create).await
    }

    pub async fn get_dataset(&self, name: &str) -> Result<Dataset> {
        debug!(dataset = %name, "Reading dataset");
        self.invoke(GET, json!([name]), classify_get).await
    }

    /// Set the reference quota; returns the dataset as updated
    pub async fn set_dataset_quota(&self, name: &str, refquota: i64) -> Result<Dataset> {
        info!(dataset = %name, refquota, "Updating dataset quota");
        let quota = DatasetQuota { refquota };
        self.invoke(UPDATE, json!([name, quota]), classify_update).await
    }

    /// Make a clone independent of its origin snapshot
    pub async fn promote_dataset(&self, name: &str) -> Result<()> {
        info!(dataset = %name, "Promoting dataset");
        let _: Value = self.invoke(PROMOTE, json!([name]), internal).await?;
        Ok(())
    }

    /// Delete a dataset with its snapshots and shares. Absent datasets are fine.
    pub async fn delete_dataset(&self, name: &str) -> Result<()> {
        info!(dataset = %name, "Deleting dataset");
        let _: Option<Value> = self
            .invoke_idempotent(DELETE, json!([name]), classify_delete)
            .await?;
        Ok(())
    }

    /// Apply mode and ownership to a dataset mount path
    pub async fn set_permissions(&self, path: &str, options: &PermissionOptions) -> Result<()> {
        debug!(path = %path, ?options, "Setting permissions");
        let params = single(SetPermissions { path, options })?;
        let _: Value = self.invoke(SET_PERMISSIONS, params, internal).await?;
        Ok(())
    }

    /// Start a job destroying every snapshot of `name`; `None` if the dataset is gone
    pub async fn destroy_snapshots(&self, name: &str) -> Result<Option<i64>> {
        debug!(dataset = %name, "Destroying dataset snapshots");
        self.invoke_idempotent(DESTROY_SNAPSHOTS, json!([name]), classify_destroy_snapshots)
            .await
    }
}
