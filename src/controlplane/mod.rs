//! Volume Control Plane
//!
//! Turns inbound volume and snapshot requests into sequences of appliance
//! calls:
//! - `params`: storage-class parameter and secret validation
//! - `locks`: per-resource exclusion between concurrent workflows
//! - `jobs`: polling of asynchronous appliance jobs
//! - `orchestrator`: the workflows themselves, with undo on failure
//! - `backends`: typed TrueNAS Scale operations

pub mod backends;
pub mod jobs;
pub mod locks;
pub mod orchestrator;
pub mod params;

pub use jobs::{JobPollConfig, JobPoller};
pub use locks::{ResourceGuard, ResourceLocks};
pub use orchestrator::*;
pub use params::{ApplianceParams, VolumeParams};
