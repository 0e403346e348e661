//! Asynchronous job poller
//!
//! Queries a middleware job until it leaves `RUNNING`, sleeping a fixed
//! interval between queries. Polling is unbounded unless `max_polls` is set;
//! callers that need a deadline can also wrap [`JobPoller::wait`] in a
//! timeout, which cancels the poll loop at its next suspension point.

use super::backends::truenas::{Job, TrueNasApi};
use crate::error::{Error, Result};
use crate::metrics::ControllerMetrics;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const STATE_RUNNING: &str = "RUNNING";
pub const STATE_SUCCESS: &str = "SUCCESS";
pub const STATE_FAILED: &str = "FAILED";
pub const STATE_ABORTED: &str = "ABORTED";

/// Configuration for job polling
#[derive(Debug, Clone)]
pub struct JobPollConfig {
    /// Sleep between two status queries
    pub interval: Duration,
    /// Give up after this many queries; `None` polls until a terminal state
    pub max_polls: Option<u32>,
}

impl Default for JobPollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_polls: None,
        }
    }
}

pub struct JobPoller {
    config: JobPollConfig,
    metrics: Arc<ControllerMetrics>,
}

impl JobPoller {
    pub fn new(config: JobPollConfig, metrics: Arc<ControllerMetrics>) -> Self {
        Self { config, metrics }
    }

    pub fn config(&self) -> &JobPollConfig {
        &self.config
    }

    /// Wait for job `job_id` to finish successfully
    pub async fn wait(&self, api: &TrueNasApi<'_>, job_id: i64) -> Result<Job> {
        let started = Instant::now();
        let mut polls: u32 = 0;

        loop {
            let job = api.job_status(job_id).await?;
            polls += 1;
            self.metrics.job_polled();

            match job.state.as_str() {
                STATE_RUNNING => {
                    if self.config.max_polls.is_some_and(|max| polls >= max) {
                        warn!(job_id, polls, "Job still running, giving up");
                        return Err(Error::JobPollExhausted {
                            job_id,
                            polls,
                            elapsed: started.elapsed(),
                        });
                    }
                    debug!(job_id, polls, "Job running");
                    tokio::time::sleep(self.config.interval).await;
                }
                STATE_SUCCESS => {
                    info!(job_id, polls, "Job finished");
                    return Ok(job);
                }
                STATE_FAILED | STATE_ABORTED => {
                    warn!(job_id, state = %job.state, "Job failed: {}", job.error);
                    return Err(Error::JobFailed {
                        job_id,
                        detail: describe(&job.error),
                        state: job.state,
                    });
                }
                other => {
                    return Err(Error::Internal(format!(
                        "job {} in unexpected state {:?}",
                        job_id, other
                    )));
                }
            }
        }
    }
}

fn describe(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        Value::Null => "no error reported".to_string(),
        other => other.to_string(),
    }
}
