//! Orchestration Engine
//!
//! Composes backend operations into the volume and snapshot workflows:
//! - Volume create, with optional cloning from a snapshot or another volume
//! - Volume delete under the delete / retain / archive policies
//! - Volume expand, capacity and describe
//! - Snapshot create and delete
//!
//! Every workflow validates its input, takes the resource lock for its key
//! and leases one pooled session for its backend steps. A workflow cancelled
//! mid-flight drops its lease, which closes the session. When a later step
//! fails, completed steps are undone in order; undo failures are logged and
//! never replace the original error.

use super::backends::truenas::dataset::MINIMUM_DATASET_SIZE;
use super::backends::truenas::TrueNasApi;
use super::jobs::{JobPollConfig, JobPoller};
use super::locks::ResourceLocks;
use super::params::{self, ApplianceParams, VolumeParams};
use crate::domain::identifier::{SnapshotHandle, VolumeHandle};
use crate::domain::naming::{build_dataset_name, DEFAULT_ARCHIVE_PREFIX};
use crate::domain::ports::{
    AccessType, ApiKey, CapacityResponse, ContentSource, CreateSnapshotRequest,
    CreateSnapshotResponse, CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest,
    DeleteVolumeRequest, ExpandVolumeRequest, ExpandVolumeResponse, GetCapacityRequest,
    OnDeletePolicy, VolumeInfo,
};
use crate::error::{Code, Error, Result};
use crate::metrics::ControllerMetrics;
use crate::transport::{ConnectionPool, SessionLease};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Driver name recorded in dataset comments
pub const DEFAULT_DRIVER_NAME: &str = "tns.csi.titou10.org";

/// Volume context keys read by the node side
pub const CONTEXT_ENDPOINT: &str = "tnswsurl";
pub const CONTEXT_SHARE_PATH: &str = "nfssharepath";
pub const CONTEXT_DATASET: &str = "dsname";

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Written into the comments of every dataset created
    pub driver_name: String,
    /// Policy for volumes whose identifier carries none
    pub default_on_delete: OnDeletePolicy,
    /// Skip TLS certificate verification towards the appliance
    pub allow_insecure_tls: bool,
    /// Replication job polling
    pub jobs: JobPollConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            default_on_delete: OnDeletePolicy::Delete,
            allow_insecure_tls: true,
            jobs: JobPollConfig::default(),
        }
    }
}

// =============================================================================
// Workflow Plans
// =============================================================================

/// Initial content of a new volume, resolved from the request
#[derive(Debug, Clone, PartialEq, Eq)]
enum ClonePlan {
    Empty,
    FromSnapshot {
        endpoint: String,
        dataset: String,
        snapshot: String,
    },
    FromVolume {
        endpoint: String,
        dataset: String,
    },
}

impl ClonePlan {
    fn endpoint(&self) -> Option<&str> {
        match self {
            ClonePlan::Empty => None,
            ClonePlan::FromSnapshot { endpoint, .. } | ClonePlan::FromVolume { endpoint, .. } => {
                Some(endpoint)
            }
        }
    }
}

/// Decode a content source. An unusable identifier means the source is absent.
fn plan_clone(source: Option<&ContentSource>) -> Result<ClonePlan> {
    match source {
        None => Ok(ClonePlan::Empty),
        Some(ContentSource::Snapshot(id)) => {
            let handle = SnapshotHandle::decode(id)
                .map_err(|e| Error::NotFound(format!("source snapshot: {}", e)))?;
            let (dataset, snapshot) = handle.parts().ok_or_else(|| {
                Error::NotFound(format!("source snapshot {:?} is not dataset@name", id))
            })?;
            Ok(ClonePlan::FromSnapshot {
                endpoint: handle.endpoint.clone(),
                dataset: dataset.to_string(),
                snapshot: snapshot.to_string(),
            })
        }
        Some(ContentSource::Volume(id)) => {
            let handle = VolumeHandle::decode(id)
                .map_err(|e| Error::NotFound(format!("source volume: {}", e)))?;
            Ok(ClonePlan::FromVolume {
                endpoint: handle.endpoint,
                dataset: handle.dataset,
            })
        }
    }
}

fn same_endpoint(a: &str, b: &str) -> bool {
    a.trim_matches('/') == b.trim_matches('/')
}

/// Names used while archiving one volume
#[derive(Debug, Clone, PartialEq, Eq)]
struct ArchivePlan {
    /// Short name of the temporary snapshot
    snapshot: String,
    /// Dataset the volume is preserved under
    dataset: String,
}

fn plan_archive(handle: &VolumeHandle) -> ArchivePlan {
    let root = if handle.root.is_empty() {
        handle
            .dataset
            .rsplit_once('/')
            .map(|(parent, _)| parent)
            .unwrap_or_default()
    } else {
        handle.root.as_str()
    };
    let prefix = if handle.archive_prefix.is_empty() {
        DEFAULT_ARCHIVE_PREFIX
    } else {
        handle.archive_prefix.as_str()
    };

    let base = handle
        .dataset
        .strip_prefix(root)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(&handle.dataset)
        .replace('/', "_");
    let snapshot = format!("{}_{}", prefix, base);
    let dataset = if root.is_empty() {
        snapshot.clone()
    } else {
        format!("{}/{}", root, snapshot)
    };
    ArchivePlan { snapshot, dataset }
}

/// Undo step for a partially completed workflow
#[derive(Debug, Clone, PartialEq, Eq)]
enum Compensation {
    /// Deferred while a clone still depends on the snapshot
    DeleteSnapshot(String),
    DeleteDataset(String),
    PromoteDataset(String),
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs volume and snapshot workflows against pooled appliance sessions
pub struct Orchestrator {
    config: OrchestratorConfig,
    pool: Arc<ConnectionPool>,
    locks: Arc<ResourceLocks>,
    metrics: Arc<ControllerMetrics>,
    poller: JobPoller,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(
        config: OrchestratorConfig,
        pool: Arc<ConnectionPool>,
        metrics: Arc<ControllerMetrics>,
    ) -> Arc<Self> {
        let poller = JobPoller::new(config.jobs.clone(), metrics.clone());
        Arc::new(Self {
            config,
            pool,
            locks: ResourceLocks::new(),
            metrics,
            poller,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn locks(&self) -> &Arc<ResourceLocks> {
        &self.locks
    }

    // =========================================================================
    // Volume Workflows
    // =========================================================================

    /// Create a dataset with its NFS share, optionally filled from a content source
    pub async fn create_volume(&self, req: CreateVolumeRequest) -> Result<CreateVolumeResponse> {
        let started = Instant::now();
        let result = self.run_create_volume(req).await;
        self.observe("create_volume", started, &result);
        result
    }

    /// Delete, retain or archive a volume. Unknown volumes are already deleted.
    pub async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<()> {
        let started = Instant::now();
        let result = self.run_delete_volume(req).await;
        self.observe("delete_volume", started, &result);
        result
    }

    /// Raise the dataset quota; returns the quota observed afterwards
    pub async fn expand_volume(&self, req: ExpandVolumeRequest) -> Result<ExpandVolumeResponse> {
        let started = Instant::now();
        let result = self.run_expand_volume(req).await;
        self.observe("expand_volume", started, &result);
        result
    }

    /// Space available under the root dataset
    pub async fn get_capacity(&self, req: GetCapacityRequest) -> Result<CapacityResponse> {
        let started = Instant::now();
        let result = self.run_get_capacity(req).await;
        self.observe("get_capacity", started, &result);
        result
    }

    /// Current quota, free space and share of an existing volume
    pub async fn describe_volume(
        &self,
        volume_id: &str,
        secrets: &BTreeMap<String, String>,
    ) -> Result<VolumeInfo> {
        let started = Instant::now();
        let result = self.run_describe_volume(volume_id, secrets).await;
        self.observe("describe_volume", started, &result);
        result
    }

    // =========================================================================
    // Snapshot Workflows
    // =========================================================================

    pub async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<CreateSnapshotResponse> {
        let started = Instant::now();
        let result = self.run_create_snapshot(req).await;
        self.observe("create_snapshot", started, &result);
        result
    }

    /// Delete a snapshot. Unknown or absent snapshots are already deleted.
    pub async fn delete_snapshot(&self, req: DeleteSnapshotRequest) -> Result<()> {
        let started = Instant::now();
        let result = self.run_delete_snapshot(req).await;
        self.observe("delete_snapshot", started, &result);
        result
    }

    // -------------------------------------------------------------------------
    // Create
    // -------------------------------------------------------------------------

    async fn run_create_volume(&self, req: CreateVolumeRequest) -> Result<CreateVolumeResponse> {
        if req.name.is_empty() {
            return Err(Error::InvalidArgument(
                "CreateVolume name must be provided".to_string(),
            ));
        }
        if req.access_type == AccessType::Block {
            return Err(Error::FailedPrecondition(
                "block access is not supported, volumes are NFS shares".to_string(),
            ));
        }
        if req.capacity_bytes < 0 {
            return Err(Error::InvalidArgument(format!(
                "negative capacity {}",
                req.capacity_bytes
            )));
        }

        let params = VolumeParams::parse(&req.parameters, &req.name)?;
        let api_key = params::api_key(&req.secrets)?;
        let plan = plan_clone(req.content_source.as_ref())?;
        if let Some(source) = plan.endpoint() {
            if !same_endpoint(source, &params.appliance.endpoint) {
                return Err(Error::InvalidArgument(format!(
                    "content source lives on {}, not on {}",
                    source, params.appliance.endpoint
                )));
            }
        }

        let _guard = self.locks.try_acquire(&req.name)?;

        let dataset = build_dataset_name(
            &params.appliance.root,
            &params.archive_prefix,
            &params.name_template,
            &params.metadata,
        );
        info!(
            pv = %req.name,
            dataset = %dataset,
            capacity = req.capacity_bytes,
            "Creating volume"
        );

        let session = self.checkout(&params.appliance.endpoint, &api_key).await?;
        let provisioned = self
            .provision(
                &TrueNasApi::new(&session),
                &dataset,
                req.capacity_bytes,
                &params,
                &plan,
            )
            .await;
        session.release().await;
        let share_path = provisioned?;

        let handle = VolumeHandle {
            endpoint: params.appliance.endpoint.clone(),
            root: params.appliance.root.clone(),
            dataset: dataset.clone(),
            pv_name: req.name.clone(),
            archive_prefix: params.archive_prefix.clone(),
            on_delete: params.on_delete,
        };

        let mut volume_context = req.parameters;
        volume_context.insert(CONTEXT_ENDPOINT.to_string(), params.appliance.endpoint);
        volume_context.insert(CONTEXT_SHARE_PATH.to_string(), share_path);
        volume_context.insert(CONTEXT_DATASET.to_string(), dataset);

        Ok(CreateVolumeResponse {
            volume_id: handle.encode(),
            // Zero lets the provisioner size the volume from the claim
            capacity_bytes: 0,
            volume_context,
            content_source: req.content_source,
        })
    }

    /// Dataset, permissions, share, then content. Returns the share path.
    async fn provision(
        &self,
        api: &TrueNasApi<'_>,
        dataset: &str,
        capacity: i64,
        params: &VolumeParams,
        plan: &ClonePlan,
    ) -> Result<String> {
        if let ClonePlan::FromSnapshot {
            dataset: source,
            snapshot,
            ..
        } = plan
        {
            self.ensure_snapshot(api, source, snapshot).await?;
        }

        let created = api
            .create_dataset(dataset, capacity, &self.config.driver_name)
            .await?;
        let mount_path = created.mount_path();

        if let Err(e) = api.set_permissions(&mount_path, &params.permissions).await {
            self.unwind(api, &[Compensation::DeleteDataset(dataset.to_string())])
                .await;
            return Err(e);
        }

        let share = match api.create_share(&mount_path, &params.share).await {
            Ok(share) => share,
            Err(e) => {
                self.unwind(api, &[Compensation::DeleteDataset(dataset.to_string())])
                    .await;
                return Err(e);
            }
        };

        match plan {
            ClonePlan::Empty => {}
            ClonePlan::FromSnapshot {
                dataset: source,
                snapshot,
                ..
            } => self.clone_from_snapshot(api, source, snapshot, dataset).await?,
            ClonePlan::FromVolume {
                dataset: source, ..
            } => self.clone_from_volume(api, source, dataset).await?,
        }

        if share.path.is_empty() {
            Ok(mount_path)
        } else {
            Ok(share.path)
        }
    }

    async fn ensure_snapshot(&self, api: &TrueNasApi<'_>, dataset: &str, snapshot: &str) -> Result<()> {
        let full_name = format!("{}@{}", dataset, snapshot);
        let existing = api.list_snapshots(dataset).await?;
        if existing.iter().any(|s| s.name == full_name) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("source snapshot {} not found", full_name)))
        }
    }

    // -------------------------------------------------------------------------
    // Clone
    // -------------------------------------------------------------------------

    /// Replicate a temporary snapshot of `source` into `target`
    async fn clone_from_volume(&self, api: &TrueNasApi<'_>, source: &str, target: &str) -> Result<()> {
        let temp = uuid::Uuid::new_v4().to_string();
        let temp_full = format!("{}@{}", source, temp);
        info!(source = %source, target = %target, snapshot = %temp, "Cloning volume");

        if let Err(e) = api.create_snapshot(source, &temp).await {
            self.unwind(api, &[Compensation::DeleteDataset(target.to_string())])
                .await;
            return Err(e);
        }

        if let Err(e) = self.replicate(api, source, &temp, target).await {
            self.unwind(
                api,
                &[
                    Compensation::DeleteDataset(target.to_string()),
                    Compensation::DeleteSnapshot(temp_full),
                ],
            )
            .await;
            return Err(e);
        }

        self.unwind(api, &[Compensation::DeleteSnapshot(temp_full)]).await;
        self.purge_snapshots(api, target).await;
        info!(source = %source, target = %target, "Volume clone complete");
        Ok(())
    }

    /// Replicate `source@snapshot` into `target`
    async fn clone_from_snapshot(
        &self,
        api: &TrueNasApi<'_>,
        source: &str,
        snapshot: &str,
        target: &str,
    ) -> Result<()> {
        info!(source = %source, snapshot = %snapshot, target = %target, "Cloning snapshot");

        if let Err(e) = self.replicate(api, source, snapshot, target).await {
            self.unwind(api, &[Compensation::DeleteDataset(target.to_string())])
                .await;
            return Err(e);
        }

        self.purge_snapshots(api, target).await;
        info!(source = %source, target = %target, "Snapshot clone complete");
        Ok(())
    }

    async fn replicate(&self, api: &TrueNasApi<'_>, source: &str, snapshot: &str, target: &str) -> Result<()> {
        let job_id = api.replicate_snapshot(source, snapshot, target).await?;
        self.poller.wait(api, job_id).await?;
        Ok(())
    }

    /// Best-effort removal of every snapshot on `dataset`
    async fn purge_snapshots(&self, api: &TrueNasApi<'_>, dataset: &str) {
        match api.destroy_snapshots(dataset).await {
            Ok(Some(job_id)) => debug!(dataset = %dataset, job_id, "Snapshot purge started"),
            Ok(None) => {}
            Err(e) => warn!(dataset = %dataset, "Snapshot purge failed, continuing: {}", e),
        }
    }

    // -------------------------------------------------------------------------
    // Delete / Archive
    // -------------------------------------------------------------------------

    async fn run_delete_volume(&self, req: DeleteVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id is empty".to_string()));
        }
        let handle = match VolumeHandle::decode(&req.volume_id) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(volume_id = %req.volume_id, "Unknown volume, nothing to delete: {}", e);
                return Ok(());
            }
        };
        let api_key = params::api_key(&req.secrets)?;
        let _guard = self.locks.try_acquire(&req.volume_id)?;

        let policy = handle.on_delete.unwrap_or(self.config.default_on_delete);
        info!(dataset = %handle.dataset, policy = %policy, "Deleting volume");
        if policy == OnDeletePolicy::Retain {
            info!(dataset = %handle.dataset, "Retaining dataset");
            return Ok(());
        }

        let session = self.checkout(&handle.endpoint, &api_key).await?;
        let api = TrueNasApi::new(&session);
        let result = match policy {
            OnDeletePolicy::Archive => self.archive(&api, &handle).await,
            _ => api.delete_dataset(&handle.dataset).await,
        };
        session.release().await;
        result
    }

    /// Preserve a volume under `<root>/<prefix>_<name>` and drop the original
    async fn archive(&self, api: &TrueNasApi<'_>, handle: &VolumeHandle) -> Result<()> {
        let plan = plan_archive(handle);
        let source = handle.dataset.as_str();
        info!(dataset = %source, archive = %plan.dataset, "Archiving volume");

        if let Err(e) = api.create_snapshot(source, &plan.snapshot).await {
            if e.code() == Code::NotFound {
                warn!(dataset = %source, "Dataset already gone, nothing to archive");
                return Ok(());
            }
            return Err(e);
        }
        let snapshot = format!("{}@{}", source, plan.snapshot);
        let mut undo = vec![Compensation::DeleteSnapshot(snapshot.clone())];

        if let Err(e) = api.clone_snapshot(&snapshot, &plan.dataset).await {
            self.unwind(api, &undo).await;
            return Err(e);
        }
        undo.push(Compensation::DeleteDataset(plan.dataset.clone()));

        if let Err(e) = api.promote_dataset(&plan.dataset).await {
            self.unwind(api, &undo).await;
            return Err(e);
        }
        // Promotion hands the snapshot to the archive; the original must take it back first
        undo.insert(0, Compensation::PromoteDataset(source.to_string()));

        if let Err(e) = api.delete_dataset(source).await {
            self.unwind(api, &undo).await;
            return Err(e);
        }

        self.purge_snapshots(api, &plan.dataset).await;
        info!(dataset = %source, archive = %plan.dataset, "Volume archived");
        Ok(())
    }

    /// Run undo steps in order, logging failures
    async fn unwind(&self, api: &TrueNasApi<'_>, steps: &[Compensation]) {
        for step in steps {
            let result = match step {
                Compensation::DeleteSnapshot(name) => api.delete_snapshot_deferred(name).await,
                Compensation::DeleteDataset(name) => api.delete_dataset(name).await,
                Compensation::PromoteDataset(name) => api.promote_dataset(name).await,
            };
            if let Err(e) = result {
                warn!(?step, "Cleanup failed, continuing: {}", e);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Expand / Capacity / Describe
    // -------------------------------------------------------------------------

    async fn run_expand_volume(&self, req: ExpandVolumeRequest) -> Result<ExpandVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument(
                "Volume ID missing in request".to_string(),
            ));
        }
        if req.capacity_bytes <= 0 {
            return Err(Error::InvalidArgument(
                "Capacity Range missing in request".to_string(),
            ));
        }
        let api_key = params::api_key(&req.secrets)?;
        let handle = match VolumeHandle::decode(&req.volume_id) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(volume_id = %req.volume_id, "Unknown volume, nothing to expand: {}", e);
                return Ok(ExpandVolumeResponse::default());
            }
        };
        let _guard = self.locks.try_acquire(&req.volume_id)?;

        let session = self.checkout(&handle.endpoint, &api_key).await?;
        let updated = TrueNasApi::new(&session)
            .set_dataset_quota(&handle.dataset, req.capacity_bytes)
            .await;
        session.release().await;

        let capacity_bytes = updated?.refquota.as_bytes().unwrap_or_default();
        info!(dataset = %handle.dataset, capacity_bytes, "Volume expanded");
        Ok(ExpandVolumeResponse { capacity_bytes })
    }

    async fn run_get_capacity(&self, req: GetCapacityRequest) -> Result<CapacityResponse> {
        let appliance = ApplianceParams::parse(&req.parameters)?;
        let api_key = params::api_key(&req.secrets)?;

        let session = self.checkout(&appliance.endpoint, &api_key).await?;
        let root = TrueNasApi::new(&session).get_dataset(&appliance.root).await;
        session.release().await;

        let root = root?;
        let available_bytes = root.available.as_bytes().ok_or_else(|| {
            Error::Internal(format!(
                "cannot read available bytes of {}: {:?}",
                appliance.root, root.available.parsed
            ))
        })?;
        debug!(root = %appliance.root, available_bytes, "Capacity read");
        Ok(CapacityResponse {
            available_bytes,
            minimum_volume_bytes: MINIMUM_DATASET_SIZE,
        })
    }

    async fn run_describe_volume(
        &self,
        volume_id: &str,
        secrets: &BTreeMap<String, String>,
    ) -> Result<VolumeInfo> {
        let handle = VolumeHandle::decode(volume_id)
            .map_err(|e| Error::NotFound(format!("volume: {}", e)))?;
        let api_key = params::api_key(secrets)?;

        let session = self.checkout(&handle.endpoint, &api_key).await?;
        let api = TrueNasApi::new(&session);
        let observed = async {
            let dataset = api.get_dataset(&handle.dataset).await?;
            let share = api.get_share(&dataset.mount_path()).await?;
            Ok::<_, Error>((dataset, share))
        }
        .await;
        session.release().await;

        let (dataset, share) = observed?;
        Ok(VolumeInfo {
            volume_id: volume_id.to_string(),
            dataset: dataset.name,
            quota_bytes: dataset.refquota.as_bytes().unwrap_or_default(),
            available_bytes: dataset.available.as_bytes().unwrap_or_default(),
            share_path: share.map(|s| s.path),
        })
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    async fn run_create_snapshot(&self, req: CreateSnapshotRequest) -> Result<CreateSnapshotResponse> {
        if req.name.is_empty() {
            return Err(Error::InvalidArgument(
                "CreateSnapshot name must be provided".to_string(),
            ));
        }
        if req.source_volume_id.is_empty() {
            return Err(Error::InvalidArgument(
                "CreateSnapshot source volume ID must be provided".to_string(),
            ));
        }
        let api_key = params::api_key(&req.secrets)?;
        let source = VolumeHandle::decode(&req.source_volume_id)
            .map_err(|e| Error::NotFound(format!("source volume: {}", e)))?;
        params::ensure_no_parameters(&req.parameters)?;

        let _guard = self.locks.try_acquire(&req.name)?;
        info!(dataset = %source.dataset, snapshot = %req.name, "Creating snapshot");

        let session = self.checkout(&source.endpoint, &api_key).await?;
        let created = TrueNasApi::new(&session)
            .create_snapshot(&source.dataset, &req.name)
            .await;
        session.release().await;
        let snapshot = created?;

        let snapshot_name = if snapshot.name.is_empty() {
            format!("{}@{}", source.dataset, req.name)
        } else {
            snapshot.name
        };
        let handle = SnapshotHandle {
            endpoint: source.endpoint.clone(),
            root: source.root.clone(),
            snapshot_name,
            source_dataset: source.dataset.clone(),
        };

        Ok(CreateSnapshotResponse {
            snapshot_id: handle.encode(),
            source_volume_id: req.source_volume_id,
            size_bytes: snapshot.properties.referenced.as_bytes().unwrap_or_default(),
            creation_time: chrono::Utc::now(),
            ready_to_use: true,
        })
    }

    async fn run_delete_snapshot(&self, req: DeleteSnapshotRequest) -> Result<()> {
        if req.snapshot_id.is_empty() {
            return Err(Error::InvalidArgument(
                "Snapshot ID is required for deletion".to_string(),
            ));
        }
        let handle = match SnapshotHandle::decode(&req.snapshot_id) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(snapshot_id = %req.snapshot_id, "Unknown snapshot, nothing to delete: {}", e);
                return Ok(());
            }
        };
        let api_key = params::api_key(&req.secrets)?;
        let _guard = self.locks.try_acquire(&req.snapshot_id)?;

        let session = self.checkout(&handle.endpoint, &api_key).await?;
        let result = TrueNasApi::new(&session)
            .delete_snapshot(&handle.snapshot_name)
            .await;
        session.release().await;
        result
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn checkout(&self, endpoint: &str, api_key: &ApiKey) -> Result<SessionLease> {
        self.pool
            .lease(endpoint, api_key, self.config.allow_insecure_tls)
            .await
    }

    fn observe<T>(&self, operation: &'static str, started: Instant, result: &Result<T>) {
        let elapsed = started.elapsed();
        match result {
            Ok(_) => {
                self.metrics.record_workflow(operation, "success", elapsed);
                debug!(operation, ?elapsed, "Workflow completed");
            }
            Err(e) => {
                let code = e.code();
                self.metrics
                    .record_workflow(operation, &code.to_string(), elapsed);
                if code == Code::Aborted {
                    warn!(operation, "{}", e);
                } else {
                    error!(operation, %code, "Workflow failed: {}", e);
                }
            }
        }
    }
}
