//! TNS CSI Controller - Volume lifecycle for TrueNAS Scale
//!
//! Provisions NFS-exported ZFS datasets on TrueNAS Scale appliances through
//! their WebSocket API: create (empty or cloned), delete / retain / archive,
//! expand, snapshot and capacity.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          Orchestrator                                │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────┐  ┌───────────┐  │
//! │  │  Parameter   │  │   Resource   │  │    Job     │  │ Identifier│  │
//! │  │  Validation  │  │    Locks     │  │   Poller   │  │  / Naming │  │
//! │  └──────┬───────┘  └──────┬───────┘  └─────┬──────┘  └─────┬─────┘  │
//! │         └─────────────────┴────────┬───────┴───────────────┘        │
//! │                                    │                                 │
//! │                       ┌────────────┴────────────┐                    │
//! │                       │   TrueNAS Operations    │                    │
//! │                       │ dataset/snapshot/share  │                    │
//! │                       └────────────┬────────────┘                    │
//! ├────────────────────────────────────┼────────────────────────────────┤
//! │                          Transport │                                 │
//! │  ┌──────────────┐  ┌───────────────┴──┐  ┌───────────────────────┐  │
//! │  │   Endpoint   │  │ Connection Pool  │  │   RPC (legacy and     │  │
//! │  │  / Dialect   │  │ (reuse, reclaim) │  │   JSON-RPC 2.0)       │  │
//! │  └──────────────┘  └──────────────────┘  └───────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: workflows, validation, locking and backend operations
//! - [`transport`]: appliance sessions over WebSocket
//! - [`domain`]: identifiers, dataset naming and port definitions
//! - [`metrics`]: Prometheus metrics
//! - [`error`]: Error taxonomy

pub mod controlplane;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use controlplane::{JobPollConfig, Orchestrator, OrchestratorConfig};

pub use domain::ports::{
    AccessType, ApiKey, CapacityResponse, Clock, ContentSource, CreateSnapshotRequest,
    CreateSnapshotResponse, CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest,
    DeleteVolumeRequest, ExpandVolumeRequest, ExpandVolumeResponse, GetCapacityRequest,
    OnDeletePolicy, SystemClock, VolumeInfo,
};

pub use domain::{SnapshotHandle, VolumeHandle};

pub use error::{Code, Error, Result};

pub use metrics::ControllerMetrics;

pub use transport::{ConnectionPool, PoolConfig, WebSocketConnector};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
