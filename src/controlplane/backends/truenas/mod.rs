//! TrueNAS Scale Backend Operations
//!
//! Typed calls over a checked-out [`Session`]. Each operation decodes the
//! appliance's free-text failure reason into a taxonomy [`Code`] through its
//! own classification function, so the matching rules can be tested against
//! literal appliance messages.

pub mod dataset;
pub mod job;
pub mod model;
pub mod share;
pub mod snapshot;

pub use model::*;

use crate::error::{Code, Error, Result};
use crate::transport::{rpc, BackendFault, RpcError, Session};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

pub(crate) const NOT_FOUND_REASONS: [&str; 2] = ["does not exist", "not found"];

/// Typed facade over one checked-out session
#[derive(Debug, Clone, Copy)]
pub struct TrueNasApi<'s> {
    session: &'s Session,
}

impl<'s> TrueNasApi<'s> {
    pub fn new(session: &'s Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &'s Session {
        self.session
    }

    /// Call `method`; failures are classified by `classify`
    async fn invoke<T, C>(&self, method: &'static str, params: Value, classify: C) -> Result<T>
    where
        T: DeserializeOwned,
        C: Fn(&BackendFault) -> Code,
    {
        rpc::call(self.session, method, params)
            .await
            .map_err(|e| classified(method, e, &classify))
    }

    /// Call a delete-class `method`. `Ok(None)` when `absent` matches the fault.
    async fn invoke_idempotent<T, C>(
        &self,
        method: &'static str,
        params: Value,
        classify: C,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        C: Fn(&BackendFault) -> Option<Code>,
    {
        match rpc::call(self.session, method, params).await {
            Ok(value) => Ok(Some(value)),
            Err(RpcError::Fault(fault)) => match classify(&fault) {
                None => {
                    warn!(method, "Target already absent, continuing: {}", fault.reason);
                    Ok(None)
                }
                Some(code) => Err(Error::Backend {
                    code,
                    operation: method,
                    fault,
                }),
            },
            Err(other) => Err(Error::transport(method, other)),
        }
    }
}

fn classified<C>(method: &'static str, err: RpcError, classify: &C) -> Error
where
    C: Fn(&BackendFault) -> Code,
{
    match err {
        RpcError::Fault(fault) => Error::Backend {
            code: classify(&fault),
            operation: method,
            fault,
        },
        other => Error::transport(method, other),
    }
}

/// Serialize a payload as the single positional parameter
pub(crate) fn single<P: Serialize>(payload: P) -> Result<Value> {
    Ok(Value::Array(vec![serde_json::to_value(payload)?]))
}

/// Every failure is Internal
pub(crate) fn internal(_: &BackendFault) -> Code {
    Code::Internal
}
