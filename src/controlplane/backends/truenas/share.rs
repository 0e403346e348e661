//! NFS share operations

use super::{internal, single, NfsShare, ShareCreate, ShareOptions, TrueNasApi};
use crate::error::{Code, Result};
use crate::transport::BackendFault;
use serde_json::json;
use tracing::{debug, info};

pub const CREATE: &str = "sharing.nfs.create";
pub const QUERY: &str = "sharing.nfs.query";

pub fn classify_create(fault: &BackendFault) -> Code {
    if fault.reason_contains(&["already exists"]) {
        Code::AlreadyExists
    } else {
        Code::Internal
    }
}

impl<'s> TrueNasApi<'s> {
    /// Export `path` over NFS
    pub async fn create_share(&self, path: &str, options: &ShareOptions) -> Result<NfsShare> {
        info!(path = %path, "Creating NFS share");
        let params = single(ShareCreate { path, options })?;
        self.invoke(CREATE, params, classify_create).await
    }

    /// The share exporting `path`, if any
    pub async fn get_share(&self, path: &str) -> Result<Option<NfsShare>> {
        debug!(path = %path, "Looking up NFS share");
        let filters = json!([[["path", "=", path]]]);
        let shares: Vec<NfsShare> = self.invoke(QUERY, filters, internal).await?;
        Ok(shares.into_iter().next())
    }
}
