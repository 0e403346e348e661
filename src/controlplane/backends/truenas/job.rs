//! Job status and one-time replication

use super::{internal, single, Job, OneTimeReplication, TrueNasApi};
use crate::error::{Error, Result};
use serde_json::json;
use tracing::{debug, info};

pub const STATUS: &str = "core.get_jobs";
pub const RUN_ONETIME: &str = "replication.run_onetime";

impl<'s> TrueNasApi<'s> {
    /// Current state of job `id`
    pub async fn job_status(&self, id: i64) -> Result<Job> {
        debug!(job_id = id, "Querying job");
        let filters = json!([[["id", "=", id]]]);
        let jobs: Vec<Job> = self.invoke(STATUS, filters, internal).await?;
        jobs.into_iter()
            .next()
            .ok_or_else(|| Error::Internal(format!("job {} not found", id)))
    }

    /// Replicate `source@snapshot_name` into `target`; returns the job id
    pub async fn replicate_snapshot(
        &self,
        source: &str,
        snapshot_name: &str,
        target: &str,
    ) -> Result<i64> {
        info!(
            source = %source,
            snapshot = %snapshot_name,
            target = %target,
            "Submitting one-time replication"
        );
        let params = single(OneTimeReplication::local(source, snapshot_name, target))?;
        self.invoke(RUN_ONETIME, params, internal).await
    }
}
