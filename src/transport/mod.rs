//! Appliance Transport
//!
//! Everything needed to talk to a TrueNAS Scale appliance over its
//! WebSocket API:
//! - `endpoint`: URL validation and dialect selection
//! - `pool`: persistent authenticated sessions, reuse and idle reclamation
//! - `rpc`: request framing, response correlation and fault decoding
//! - `websocket`: production channel over tokio-tungstenite

pub mod endpoint;
pub mod pool;
pub mod rpc;
pub mod websocket;

pub use endpoint::*;
pub use pool::*;
pub use rpc::*;
pub use websocket::*;

use std::time::Duration;
use thiserror::Error;

/// Structured error reported by the appliance in a response envelope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendFault {
    /// Numeric errno-style code (legacy `error`, modern `data.error`)
    pub code: i64,
    /// Symbolic errno name, e.g. `EINVAL`
    pub errname: String,
    /// Fault class, e.g. `VALIDATION`
    pub kind: String,
    /// Free-text reason; the only field classification relies on
    pub reason: String,
}

impl BackendFault {
    /// Lowercased reason used for substring classification
    pub fn reason_lower(&self) -> String {
        self.reason.to_lowercase()
    }

    /// True when the lowercased reason contains any of `needles`
    pub fn reason_contains(&self, needles: &[&str]) -> bool {
        let reason = self.reason_lower();
        needles.iter().any(|n| reason.contains(n))
    }
}

impl std::fmt::Display for BackendFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} {}: {}", self.code, self.kind, self.errname, self.reason)
    }
}

/// Failures of a single request/response exchange
#[derive(Error, Debug)]
pub enum RpcError {
    /// The appliance answered with an error envelope
    #[error("{0}")]
    Fault(BackendFault),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Channel closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl RpcError {
    /// The backend fault, when the appliance reported one
    pub fn fault(&self) -> Option<&BackendFault> {
        match self {
            RpcError::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}
