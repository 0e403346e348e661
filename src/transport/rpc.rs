//! RPC Transport
//!
//! Frames one request, waits for the response frame carrying the same id and
//! decodes either the typed result or the appliance's structured fault.

use super::endpoint::{Dialect, Endpoint};
use super::pool::Session;
use super::{BackendFault, RpcError};
use crate::domain::ports::{ApiKey, WireChannel};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Method used to authenticate a fresh channel
pub const LOGIN_METHOD: &str = "auth.login_with_api_key";

#[derive(Debug, Serialize)]
struct RequestEnvelope<'a> {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    msg: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jsonrpc: Option<&'static str>,
    method: &'a str,
    params: &'a Value,
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

impl<'a> RequestEnvelope<'a> {
    fn new(dialect: Dialect, method: &'a str, params: &'a Value) -> Self {
        let (msg, jsonrpc) = match dialect {
            Dialect::Legacy => (Some("method"), None),
            Dialect::Modern => (None, Some("2.0")),
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            msg,
            jsonrpc,
            method,
            params,
        }
    }
}

/// Issue `method` on a checked-out session and decode its result
pub async fn call<T: DeserializeOwned>(
    session: &Session,
    method: &str,
    params: Value,
) -> std::result::Result<T, RpcError> {
    let mut state = session.lock_state().await;
    let channel = state.channel.as_mut().ok_or(RpcError::Closed)?;
    let result = exchange(
        channel.as_mut(),
        session.dialect(),
        method,
        &params,
        session.call_timeout(),
    )
    .await;
    state.last_active = session.now();
    result
}

/// One request/response round trip on a raw channel
pub(crate) async fn exchange<T: DeserializeOwned>(
    channel: &mut dyn WireChannel,
    dialect: Dialect,
    method: &str,
    params: &Value,
    timeout: Duration,
) -> std::result::Result<T, RpcError> {
    let request = RequestEnvelope::new(dialect, method, params);
    let frame = serde_json::to_string(&request)?;
    if method != LOGIN_METHOD {
        trace!(method, "S: {}", frame);
    }
    channel.send_text(frame).await?;

    let response = tokio::time::timeout(timeout, async {
        loop {
            let frame = channel.recv_text().await?;
            let envelope: ResponseEnvelope = serde_json::from_str(&frame)?;
            if envelope.id.as_ref().and_then(Value::as_str) == Some(request.id.as_str()) {
                if method != LOGIN_METHOD {
                    trace!(method, "R: {}", frame);
                }
                return Ok::<_, RpcError>(envelope);
            }
            trace!(method, "Skipping uncorrelated frame: {}", frame);
        }
    })
    .await
    .map_err(|_| RpcError::Timeout(timeout))??;

    if let Some(fault) = decode_fault(&response.error) {
        debug!(method, "Appliance fault: {}", fault);
        return Err(RpcError::Fault(fault));
    }

    Ok(serde_json::from_value(response.result)?)
}

/// Normalise a legacy or JSON-RPC error object. `None` when no fault is present.
pub(crate) fn decode_fault(error: &Value) -> Option<BackendFault> {
    let object = error.as_object()?;
    let data = object
        .get("data")
        .and_then(Value::as_object)
        .unwrap_or(object);
    let text = |map: &serde_json::Map<String, Value>, key: &str| {
        map.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let code = data
        .get("error")
        .and_then(Value::as_i64)
        .or_else(|| object.get("code").and_then(Value::as_i64))
        .unwrap_or(0);
    let mut reason = text(data, "reason");
    if reason.is_empty() {
        reason = text(object, "message");
    }

    let fault = BackendFault {
        code,
        errname: text(data, "errname"),
        kind: text(data, "type"),
        reason,
    };
    if fault == BackendFault::default() {
        None
    } else {
        Some(fault)
    }
}

/// Legacy connect handshake, sent once before login
pub(crate) async fn connect_handshake(
    channel: &mut dyn WireChannel,
    timeout: Duration,
) -> std::result::Result<(), RpcError> {
    let hello = json!({"msg": "connect", "version": "1", "support": ["1"]});
    channel.send_text(hello.to_string()).await?;

    let frame = tokio::time::timeout(timeout, channel.recv_text())
        .await
        .map_err(|_| RpcError::Timeout(timeout))??;
    let reply: Value = serde_json::from_str(&frame)?;
    match reply.get("msg").and_then(Value::as_str) {
        Some("failed") => Err(RpcError::Protocol(format!("connect refused: {}", frame))),
        _ => {
            trace!("Connect OK: {}", frame);
            Ok(())
        }
    }
}

/// Authenticate a fresh channel with the appliance API key
pub(crate) async fn login(
    channel: &mut dyn WireChannel,
    endpoint: &Endpoint,
    api_key: &ApiKey,
    timeout: Duration,
) -> Result<()> {
    let params = json!([api_key.expose()]);
    let unauthenticated = |reason: String| Error::Unauthenticated {
        endpoint: endpoint.url().to_string(),
        reason,
    };

    match exchange::<bool>(channel, endpoint.dialect(), LOGIN_METHOD, &params, timeout).await {
        Ok(true) => {
            debug!(endpoint = %endpoint, "Login OK");
            Ok(())
        }
        Ok(false) => {
            warn!(endpoint = %endpoint, "Login rejected");
            Err(unauthenticated("api key rejected".to_string()))
        }
        Err(e) => {
            warn!(endpoint = %endpoint, "Login failed: {}", e);
            Err(unauthenticated(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ControllerMetrics;
    use crate::test_support::{FakeAppliance, ManualClock, LEGACY_URL, MODERN_URL, TEST_API_KEY};
    use crate::transport::{ConnectionPool, PoolConfig};
    use assert_matches::assert_matches;

    #[test]
    fn test_request_envelope_per_dialect() {
        let params = json!(["tank/a"]);
        let legacy = serde_json::to_value(RequestEnvelope::new(Dialect::Legacy, "m", &params)).unwrap();
        assert_eq!(legacy["msg"], "method");
        assert!(legacy.get("jsonrpc").is_none());

        let modern = serde_json::to_value(RequestEnvelope::new(Dialect::Modern, "m", &params)).unwrap();
        assert_eq!(modern["jsonrpc"], "2.0");
        assert!(modern.get("msg").is_none());
        assert_eq!(modern["params"][0], "tank/a");
        assert_ne!(legacy["id"], modern["id"]);
    }

    #[test]
    fn test_decode_legacy_fault() {
        let error = json!({
            "error": 2,
            "errname": "ENOENT",
            "type": "VALIDATION",
            "reason": "[ENOENT] None: PoolDataset tank/a does not exist",
            "trace": {"class": "ValidationError"}
        });
        let fault = decode_fault(&error).unwrap();
        assert_eq!(fault.code, 2);
        assert_eq!(fault.errname, "ENOENT");
        assert_eq!(fault.kind, "VALIDATION");
        assert!(fault.reason.ends_with("does not exist"));
    }

    #[test]
    fn test_decode_modern_fault() {
        let error = json!({
            "code": -32001,
            "message": "Method call error",
            "data": {
                "error": 22,
                "errname": "EINVAL",
                "reason": "[EINVAL] pool_dataset_create.name: Path tank/a already exists"
            }
        });
        let fault = decode_fault(&error).unwrap();
        assert_eq!(fault.code, 22);
        assert!(fault.reason.contains("already exists"));

        let bare = json!({"code": -32601, "message": "Method not found"});
        let fault = decode_fault(&bare).unwrap();
        assert_eq!(fault.code, -32601);
        assert_eq!(fault.reason, "Method not found");
    }

    #[test]
    fn test_no_fault() {
        assert!(decode_fault(&Value::Null).is_none());
        assert!(decode_fault(&json!({})).is_none());
    }

    async fn session_for(url: &str, appliance: &FakeAppliance) -> std::sync::Arc<Session> {
        let pool = ConnectionPool::new(
            PoolConfig::default(),
            appliance.connector(),
            ManualClock::new(),
            ControllerMetrics::new().unwrap(),
        );
        pool.acquire(url, &ApiKey::new(TEST_API_KEY), true).await.unwrap()
    }

    #[tokio::test]
    async fn test_call_both_dialects() {
        for url in [LEGACY_URL, MODERN_URL] {
            let appliance = FakeAppliance::new();
            appliance.seed_dataset("tank/csi", 0, 50 << 30);
            let session = session_for(url, &appliance).await;

            let ds: Value = call(&session, "pool.dataset.get_instance", json!(["tank/csi"]))
                .await
                .unwrap();
            assert_eq!(ds["name"], "tank/csi");
        }
    }

    #[tokio::test]
    async fn test_call_skips_uncorrelated_frames() {
        let appliance = FakeAppliance::new();
        appliance.seed_dataset("tank/csi", 0, 50 << 30);
        appliance.emit_notifications(true);
        let session = session_for(LEGACY_URL, &appliance).await;

        let ds: Value = call(&session, "pool.dataset.get_instance", json!(["tank/csi"]))
            .await
            .unwrap();
        assert_eq!(ds["name"], "tank/csi");
    }

    #[tokio::test]
    async fn test_call_surfaces_fault() {
        let appliance = FakeAppliance::new();
        let session = session_for(MODERN_URL, &appliance).await;

        let err = call::<Value>(&session, "pool.dataset.get_instance", json!(["tank/none"]))
            .await
            .unwrap_err();
        assert_matches!(err, RpcError::Fault(ref f) if f.reason.contains("does not exist"));
    }

    #[tokio::test]
    async fn test_login_is_first_call() {
        let appliance = FakeAppliance::new();
        let _session = session_for(MODERN_URL, &appliance).await;
        assert_eq!(appliance.calls(), vec![LOGIN_METHOD.to_string()]);
    }
}
