//! Controller metrics
//!
//! Metrics live in a registry owned by [`ControllerMetrics`] rather than the
//! process-global default, so several controllers (and tests) can coexist.

use crate::error::{Error, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

const NAMESPACE: &str = "tns_csi";

/// Prometheus metrics for pool, workflows and job polling
pub struct ControllerMetrics {
    registry: Registry,
    workflows: IntCounterVec,
    workflow_duration: HistogramVec,
    sessions_opened: IntCounter,
    sessions_reused: IntCounter,
    sessions_discarded: IntCounter,
    sessions_reclaimed: IntCounter,
    job_polls: IntCounter,
}

impl ControllerMetrics {
    /// Create and register all metrics in a fresh registry
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let workflows = IntCounterVec::new(
            Opts::new("workflows_total", "Workflow invocations by operation and outcome")
                .namespace(NAMESPACE),
            &["operation", "outcome"],
        )
        .map_err(metrics_error)?;
        let workflow_duration = HistogramVec::new(
            HistogramOpts::new("workflow_duration_seconds", "Duration of workflows")
                .namespace(NAMESPACE),
            &["operation"],
        )
        .map_err(metrics_error)?;
        let sessions_opened = counter("sessions_opened_total", "Sessions opened and authenticated")?;
        let sessions_reused = counter("sessions_reused_total", "Idle sessions handed out again")?;
        let sessions_discarded =
            counter("sessions_discarded_total", "Sessions dropped after failing a liveness probe")?;
        let sessions_reclaimed =
            counter("sessions_reclaimed_total", "Idle sessions closed by the reclaimer")?;
        let job_polls = counter("job_polls_total", "Job status queries issued")?;

        registry.register(Box::new(workflows.clone())).map_err(metrics_error)?;
        registry.register(Box::new(workflow_duration.clone())).map_err(metrics_error)?;
        registry.register(Box::new(sessions_opened.clone())).map_err(metrics_error)?;
        registry.register(Box::new(sessions_reused.clone())).map_err(metrics_error)?;
        registry.register(Box::new(sessions_discarded.clone())).map_err(metrics_error)?;
        registry.register(Box::new(sessions_reclaimed.clone())).map_err(metrics_error)?;
        registry.register(Box::new(job_polls.clone())).map_err(metrics_error)?;

        Ok(Arc::new(Self {
            registry,
            workflows,
            workflow_duration,
            sessions_opened,
            sessions_reused,
            sessions_discarded,
            sessions_reclaimed,
            job_polls,
        }))
    }

    pub fn record_workflow(&self, operation: &str, outcome: &str, elapsed: Duration) {
        self.workflows.with_label_values(&[operation, outcome]).inc();
        self.workflow_duration
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    pub fn session_opened(&self) {
        self.sessions_opened.inc();
    }

    pub fn session_reused(&self) {
        self.sessions_reused.inc();
    }

    pub fn session_discarded(&self) {
        self.sessions_discarded.inc();
    }

    pub fn sessions_reclaimed(&self, count: u64) {
        self.sessions_reclaimed.inc_by(count);
    }

    pub fn job_polled(&self) {
        self.job_polls.inc();
    }

    pub fn workflow_count(&self, operation: &str, outcome: &str) -> u64 {
        self.workflows.with_label_values(&[operation, outcome]).get()
    }

    pub fn opened_count(&self) -> u64 {
        self.sessions_opened.get()
    }

    pub fn reused_count(&self) -> u64 {
        self.sessions_reused.get()
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn counter(name: &str, help: &str) -> Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE)).map_err(metrics_error)
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
