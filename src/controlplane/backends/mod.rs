//! Storage Backend Adapters
//!
//! - TrueNAS Scale: ZFS datasets exported over NFS, driven through the
//!   appliance's WebSocket API

pub mod truenas;

pub use truenas::TrueNasApi;
