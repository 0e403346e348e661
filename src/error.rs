//! Error types for the TrueNAS volume controller
//!
//! Every failure surfaced by the controller carries a taxonomy [`Code`] so the
//! front-end service can translate it into its own status space without
//! inspecting messages. Transport-level failures live in
//! [`crate::transport::RpcError`] and are classified by the backend layer.

use crate::transport::{BackendFault, RpcError};
use std::time::Duration;
use thiserror::Error;

/// Taxonomy of failure kinds reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// Malformed or missing caller input, quota-bound violations
    InvalidArgument,
    /// Missing secret, dataset still has children, unsupported capability
    FailedPrecondition,
    /// Name collision at the backend
    AlreadyExists,
    /// Resource absent where presence was required
    NotFound,
    /// Operation already in progress for the same resource
    Aborted,
    /// Login to the appliance failed
    Unauthenticated,
    /// Every other backend or transport failure
    Internal,
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Code::InvalidArgument => "InvalidArgument",
            Code::FailedPrecondition => "FailedPrecondition",
            Code::AlreadyExists => "AlreadyExists",
            Code::NotFound => "NotFound",
            Code::Aborted => "Aborted",
            Code::Unauthenticated => "Unauthenticated",
            Code::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Unified error type for the controller
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Caller Errors
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("An operation with the given Volume ID {key} already exists")]
    OperationInProgress { key: String },

    // =========================================================================
    // Appliance Errors
    // =========================================================================
    #[error("{operation} failed: {fault}")]
    Backend {
        code: Code,
        operation: &'static str,
        fault: BackendFault,
    },

    #[error("Login to {endpoint} failed: {reason}")]
    Unauthenticated { endpoint: String, reason: String },

    #[error("Handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: String, reason: String },

    #[error("{operation} transport failure: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: RpcError,
    },

    // =========================================================================
    // Job Errors
    // =========================================================================
    #[error("Job {job_id} ended in state {state}: {detail}")]
    JobFailed {
        job_id: i64,
        state: String,
        detail: String,
    },

    #[error("Job {job_id} still running after {polls} polls ({elapsed:?})")]
    JobPollExhausted {
        job_id: i64,
        polls: u32,
        elapsed: Duration,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Taxonomy code for this error
    pub fn code(&self) -> Code {
        match self {
            Error::InvalidArgument(_) | Error::Configuration(_) => Code::InvalidArgument,
            Error::FailedPrecondition(_) => Code::FailedPrecondition,
            Error::NotFound(_) => Code::NotFound,
            Error::OperationInProgress { .. } => Code::Aborted,
            Error::Backend { code, .. } => *code,
            Error::Unauthenticated { .. } => Code::Unauthenticated,
            Error::Handshake { .. }
            | Error::Transport { .. }
            | Error::JobFailed { .. }
            | Error::JobPollExhausted { .. }
            | Error::Internal(_)
            | Error::JsonParse(_)
            | Error::Io(_) => Code::Internal,
        }
    }

    /// Wrap a transport failure that carries no backend classification
    pub fn transport(operation: &'static str, source: RpcError) -> Self {
        Error::Transport { operation, source }
    }

    /// Check if a caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::OperationInProgress { .. }
            | Error::Handshake { .. }
            | Error::Transport { .. }
            | Error::JobPollExhausted { .. } => true,
            Error::Backend { code, .. } => *code == Code::Internal,
            _ => false,
        }
    }
}

/// Result type alias for the controller
pub type Result<T> = std::result::Result<T, Error>;
