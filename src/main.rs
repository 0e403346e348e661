//! TNS CSI Controller
//!
//! Runs the volume orchestrator with its session reclaimer, plus health and
//! Prometheus metrics endpoints, until interrupted.

use clap::Parser;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tns_csi_controller::controlplane::params::parse_on_delete;
use tns_csi_controller::{
    ConnectionPool, ControllerMetrics, Error, JobPollConfig, OnDeletePolicy, Orchestrator,
    OrchestratorConfig, PoolConfig, Result, SystemClock, WebSocketConnector,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// TNS CSI Controller - volume lifecycle for TrueNAS Scale appliances
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Driver name, written into dataset comments
    #[arg(long, env = "DRIVER_NAME", default_value = "tns.csi.titou10.org")]
    driver_name: String,

    /// Policy for volumes created without onDelete (delete, retain, archive)
    #[arg(long, env = "DEFAULT_ONDELETE_POLICY", default_value = "")]
    default_ondelete_policy: String,

    /// Verify the appliance TLS certificate on wss:// endpoints
    #[arg(long, env = "VERIFY_TLS")]
    verify_tls: bool,

    /// Socket open, connect handshake and login timeout in seconds
    #[arg(long, env = "HANDSHAKE_TIMEOUT", default_value = "10")]
    handshake_timeout_secs: u64,

    /// Single call timeout in seconds
    #[arg(long, env = "CALL_TIMEOUT", default_value = "60")]
    call_timeout_secs: u64,

    /// Close appliance sessions idle longer than this many seconds
    #[arg(long, env = "SESSION_MAX_IDLE", default_value = "600")]
    session_max_idle_secs: u64,

    /// Idle session check interval in seconds
    #[arg(long, env = "SESSION_RECLAIM_INTERVAL", default_value = "600")]
    reclaim_interval_secs: u64,

    /// Replication job poll interval in seconds
    #[arg(long, env = "JOB_POLL_INTERVAL", default_value = "2")]
    job_poll_interval_secs: u64,

    /// Give up on a replication job after this many polls
    #[arg(long, env = "JOB_MAX_POLLS")]
    job_max_polls: Option<u32>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn default_on_delete(&self) -> Result<OnDeletePolicy> {
        if self.default_ondelete_policy.trim().is_empty() {
            Ok(OnDeletePolicy::Delete)
        } else {
            parse_on_delete(self.default_ondelete_policy.trim())
                .map_err(|e| Error::Configuration(e.to_string()))
        }
    }

    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            max_idle: Duration::from_secs(self.session_max_idle_secs),
            reclaim_interval: Duration::from_secs(self.reclaim_interval_secs),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting TNS CSI Controller");
    info!("  Version: {}", tns_csi_controller::VERSION);
    info!("  Driver: {}", args.driver_name);

    let config = OrchestratorConfig {
        driver_name: args.driver_name.clone(),
        default_on_delete: args.default_on_delete()?,
        allow_insecure_tls: !args.verify_tls,
        jobs: JobPollConfig {
            interval: Duration::from_secs(args.job_poll_interval_secs),
            max_polls: args.job_max_polls,
        },
    };
    info!("  Default on-delete policy: {}", config.default_on_delete);
    info!("  TLS verification: {}", args.verify_tls);

    let metrics = ControllerMetrics::new()?;
    let pool = ConnectionPool::new(
        args.pool_config(),
        Arc::new(WebSocketConnector::new()),
        Arc::new(SystemClock),
        metrics.clone(),
    );
    let orchestrator = Orchestrator::new(config, pool.clone(), metrics.clone());
    info!("Orchestrator initialized");

    let cancel = CancellationToken::new();
    let reclaimer = pool.spawn_reclaimer(cancel.clone());

    let health_addr = args.health_addr.clone();
    let health_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, orchestrator, health_cancel).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    let metrics_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics, metrics_cancel).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    cancel.cancel();
    if let Err(e) = reclaimer.await {
        error!("Session reclaimer ended abnormally: {}", e);
    }

    info!("Controller shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        level @ ("trace" | "debug" | "info" | "warn" | "error") => level.to_string(),
        _ => "info".to_string(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hyper=warn,tungstenite=info,tokio_tungstenite=info",
            level
        ))
    });

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(
    addr: &str,
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let orchestrator = orchestrator.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let orchestrator = orchestrator.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => Response::new(Body::from("ok")),
                        "/readyz" => Response::new(Body::from(format!(
                            "ok: {} workflows in flight",
                            orchestrator.locks().held_count()
                        ))),
                        _ => {
                            let mut resp = Response::new(Body::from("not found"));
                            *resp.status_mut() = StatusCode::NOT_FOUND;
                            resp
                        }
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    metrics: Arc<ControllerMetrics>,
    cancel: CancellationToken,
) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    if req.uri().path() != "/metrics" {
                        let mut resp = Response::new(Body::from("not found"));
                        *resp.status_mut() = StatusCode::NOT_FOUND;
                        return Ok::<_, Infallible>(resp);
                    }
                    let response = match metrics.encode() {
                        Ok((content_type, buffer)) => {
                            let mut resp = Response::new(Body::from(buffer));
                            if let Ok(value) = HeaderValue::from_str(&content_type) {
                                resp.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            resp
                        }
                        Err(e) => {
                            let mut resp = Response::new(Body::from(e.to_string()));
                            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            resp
                        }
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
