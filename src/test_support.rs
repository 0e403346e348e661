//! In-memory appliance for tests
//!
//! [`FakeAppliance`] answers both wire dialects from a synchronous model of
//! datasets, snapshots, shares and jobs. Responses are computed when a frame
//! is sent and queued for the next receive, so no background task is needed.

use crate::domain::ports::{ApiKey, Clock, Connector, ConnectorRef, WireChannel};
use crate::metrics::ControllerMetrics;
use crate::transport::{ConnectionPool, Dialect, Endpoint, PoolConfig, RpcError, Session, LOGIN_METHOD};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

pub const MODERN_URL: &str = "ws://nas.test/api/current";
pub const LEGACY_URL: &str = "ws://nas.test/websocket";
pub const TEST_API_KEY: &str = "1-test-api-key";

const MIN_QUOTA: i64 = 1 << 30;
const SNAPSHOT_REFERENCED: i64 = 96 << 10;
const JOB_FAILURE: &str = "[EFAULT] replication failed: target dataset is busy";

// =============================================================================
// Manual Clock
// =============================================================================

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc::now()),
        })
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += chrono::Duration::from_std(by).unwrap();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// =============================================================================
// Appliance Model
// =============================================================================

#[derive(Debug, Clone)]
struct FakeDataset {
    refquota: i64,
    available: i64,
    /// Snapshot this dataset was cloned from
    origin: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    datasets: BTreeMap<String, FakeDataset>,
    snapshots: BTreeMap<String, i64>,
    /// Snapshots destroyed once their last clone goes away
    deferred: BTreeSet<String>,
    shares: Vec<Value>,
    jobs: HashMap<i64, VecDeque<String>>,
    next_job_script: Option<Vec<String>>,
    next_id: i64,
    failures: HashMap<String, String>,
    failures_once: HashMap<String, String>,
    calls: Vec<String>,
    connections: usize,
    epoch: u64,
    reject_connect: bool,
    notifications: bool,
}

type Reply = std::result::Result<Value, String>;

fn property(bytes: i64) -> Value {
    json!({
        "parsed": bytes,
        "rawvalue": bytes.to_string(),
        "value": bytes.to_string(),
        "source": "LOCAL",
    })
}

fn missing_dataset(name: &str) -> String {
    format!("[ENOENT] None: PoolDataset {} does not exist", name)
}

fn missing_snapshot(name: &str) -> String {
    format!("[ENOENT] None: Snapshot {} not found", name)
}

/// Value of the first `[field, "=", value]` filter
fn filter_value(params: &Value) -> Option<&Value> {
    params.get(0)?.get(0)?.get(2)
}

fn text<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or_default()
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn dataset_json(&self, name: &str) -> Reply {
        let ds = self.datasets.get(name).ok_or_else(|| missing_dataset(name))?;
        Ok(json!({
            "id": name,
            "name": name,
            "pool": name.split('/').next().unwrap_or_default(),
            "mountpoint": format!("/mnt/{}", name),
            "available": property(ds.available),
            "refquota": property(ds.refquota),
            "comments": {"value": "", "rawvalue": "", "source": "LOCAL"},
        }))
    }

    fn snapshot_json(&self, full: &str) -> Value {
        let (dataset, short) = full.split_once('@').unwrap_or((full, ""));
        json!({
            "id": full,
            "name": full,
            "snapshot_name": short,
            "dataset": dataset,
            "properties": {"referenced": property(self.snapshots.get(full).copied().unwrap_or_default())},
        })
    }

    fn check_quota(refquota: i64) -> Result<(), String> {
        if refquota != 0 && refquota < MIN_QUOTA {
            return Err(format!(
                "[EINVAL] refquota: Should be greater than or equal to {} or Should be 0",
                MIN_QUOTA
            ));
        }
        Ok(())
    }

    fn has_clones(&self, snapshot: &str) -> bool {
        self.datasets
            .values()
            .any(|ds| ds.origin.as_deref() == Some(snapshot))
    }

    fn new_job(&mut self, states: Vec<String>) -> i64 {
        let id = self.next_id();
        self.jobs.insert(id, states.into());
        id
    }

    fn handle(&mut self, method: &str, params: &Value) -> Reply {
        if let Some(reason) = self.failures_once.remove(method) {
            return Err(reason);
        }
        if let Some(reason) = self.failures.get(method) {
            return Err(reason.clone());
        }
        let arg = params.get(0).cloned().unwrap_or(Value::Null);

        match method {
            "pool.dataset.create" => {
                let name = text(&arg, "name").to_string();
                let refquota = arg.get("refquota").and_then(Value::as_i64).unwrap_or(0);
                Self::check_quota(refquota)?;
                if self.datasets.contains_key(&name) {
                    return Err(format!("[EINVAL] pool_dataset_create.name: Path {} already exists", name));
                }
                let available = if refquota > 0 { refquota } else { 100 << 30 };
                self.datasets.insert(
                    name.clone(),
                    FakeDataset {
                        refquota,
                        available,
                        origin: None,
                    },
                );
                self.dataset_json(&name)
            }
            "pool.dataset.get_instance" => self.dataset_json(arg.as_str().unwrap_or_default()),
            "pool.dataset.update" => {
                let name = arg.as_str().unwrap_or_default().to_string();
                let refquota = params
                    .get(1)
                    .and_then(|u| u.get("refquota"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                Self::check_quota(refquota)?;
                let ds = self.datasets.get_mut(&name).ok_or_else(|| missing_dataset(&name))?;
                ds.refquota = refquota;
                self.dataset_json(&name)
            }
            "pool.dataset.promote" => {
                let name = arg.as_str().unwrap_or_default().to_string();
                let ds = self.datasets.get_mut(&name).ok_or_else(|| missing_dataset(&name))?;
                let Some(origin) = ds.origin.take() else {
                    return Ok(Value::Null);
                };
                let Some((parent, short)) = origin.split_once('@') else {
                    return Ok(Value::Null);
                };
                // the origin snapshot changes hands and the old parent becomes the clone
                let moved = format!("{}@{}", name, short);
                if let Some(referenced) = self.snapshots.remove(&origin) {
                    self.snapshots.insert(moved.clone(), referenced);
                }
                if self.deferred.remove(&origin) {
                    self.deferred.insert(moved.clone());
                }
                for (other, ds) in self.datasets.iter_mut() {
                    if other != &name && ds.origin.as_deref() == Some(origin.as_str()) {
                        ds.origin = Some(moved.clone());
                    }
                }
                let inherited = self
                    .datasets
                    .get_mut(parent)
                    .and_then(|ds| ds.origin.replace(moved));
                if let Some(ds) = self.datasets.get_mut(&name) {
                    ds.origin = inherited;
                }
                Ok(Value::Null)
            }
            "pool.dataset.delete" => {
                let name = arg.as_str().unwrap_or_default().to_string();
                if !self.datasets.contains_key(&name) {
                    return Err(missing_dataset(&name));
                }
                let child_prefix = format!("{}/", name);
                if self.datasets.keys().any(|k| k.starts_with(&child_prefix)) {
                    return Err(format!(
                        "[EFAULT] Failed to delete dataset: cannot destroy '{}': filesystem has children",
                        name
                    ));
                }
                let snap_prefix = format!("{}@", name);
                if self
                    .snapshots
                    .keys()
                    .any(|k| k.starts_with(&snap_prefix) && self.has_clones(k))
                {
                    return Err(format!(
                        "[EFAULT] Failed to delete dataset: cannot destroy '{}': filesystem has dependent clones",
                        name
                    ));
                }
                let removed = self.datasets.remove(&name);
                self.snapshots.retain(|k, _| !k.starts_with(&snap_prefix));
                if let Some(origin) = removed.and_then(|ds| ds.origin) {
                    if self.deferred.contains(&origin) && !self.has_clones(&origin) {
                        self.deferred.remove(&origin);
                        self.snapshots.remove(&origin);
                    }
                }
                let mount = format!("/mnt/{}", name);
                self.shares.retain(|s| text(s, "path") != mount);
                Ok(Value::Bool(true))
            }
            "pool.dataset.destroy_snapshots" => {
                let name = arg.as_str().unwrap_or_default().to_string();
                if !self.datasets.contains_key(&name) {
                    return Err(missing_dataset(&name));
                }
                let snap_prefix = format!("{}@", name);
                self.snapshots.retain(|k, _| !k.starts_with(&snap_prefix));
                Ok(json!(self.new_job(vec!["SUCCESS".to_string()])))
            }
            "filesystem.setperm" => {
                let path = text(&arg, "path");
                let name = path.strip_prefix("/mnt/").unwrap_or(path);
                if !self.datasets.contains_key(name) {
                    return Err(format!("[ENOENT] filesystem.setperm.path: Path {} not found", path));
                }
                Ok(json!(self.new_job(vec!["SUCCESS".to_string()])))
            }
            "sharing.nfs.create" => {
                let path = text(&arg, "path").to_string();
                if self.shares.iter().any(|s| text(s, "path") == path) {
                    return Err(format!(
                        "[EEXIST] sharing_nfs_create.path: Share already exists for {}",
                        path
                    ));
                }
                let mut share = arg.clone();
                share["id"] = json!(self.next_id());
                share["enabled"] = json!(true);
                self.shares.push(share.clone());
                Ok(share)
            }
            "sharing.nfs.query" => {
                let path = filter_value(params).and_then(Value::as_str).unwrap_or_default();
                let found: Vec<Value> = self
                    .shares
                    .iter()
                    .filter(|s| text(s, "path") == path)
                    .cloned()
                    .collect();
                Ok(Value::Array(found))
            }
            "zfs.snapshot.create" => {
                let dataset = text(&arg, "dataset");
                let full = format!("{}@{}", dataset, text(&arg, "name"));
                if !self.datasets.contains_key(dataset) {
                    return Err(format!("[ENOENT] Failed to snapshot {}: dataset does not exist", full));
                }
                if self.snapshots.contains_key(&full) {
                    return Err(format!("[EEXIST] Failed to snapshot {}: dataset already exists", full));
                }
                self.snapshots.insert(full.clone(), SNAPSHOT_REFERENCED);
                Ok(self.snapshot_json(&full))
            }
            "zfs.snapshot.delete" => {
                let full = arg.as_str().unwrap_or_default().to_string();
                if !self.snapshots.contains_key(&full) {
                    return Err(missing_snapshot(&full));
                }
                if self.has_clones(&full) {
                    let defer = params
                        .get(1)
                        .and_then(|o| o.get("defer"))
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if !defer {
                        return Err(format!(
                            "[EFAULT] Failed to delete snapshot: cannot destroy '{}': snapshot has dependent clones",
                            full
                        ));
                    }
                    self.deferred.insert(full);
                    return Ok(Value::Bool(true));
                }
                self.snapshots.remove(&full);
                Ok(Value::Bool(true))
            }
            "zfs.snapshot.clone" => {
                let snapshot = text(&arg, "snapshot").to_string();
                let target = text(&arg, "dataset_dst").to_string();
                if !self.snapshots.contains_key(&snapshot) {
                    return Err(missing_snapshot(&snapshot));
                }
                if self.datasets.contains_key(&target) {
                    return Err(format!(
                        "[EINVAL] zfs_snapshot_clone.dataset_dst: Path {} already exists",
                        target
                    ));
                }
                self.datasets.insert(
                    target,
                    FakeDataset {
                        refquota: 0,
                        available: 100 << 30,
                        origin: Some(snapshot),
                    },
                );
                Ok(Value::Bool(true))
            }
            "zfs.snapshot.query" => {
                let dataset = filter_value(params).and_then(Value::as_str).unwrap_or_default();
                let prefix = format!("{}@", dataset);
                let found: Vec<Value> = self
                    .snapshots
                    .keys()
                    .filter(|k| k.starts_with(&prefix))
                    .map(|k| self.snapshot_json(k))
                    .collect();
                Ok(Value::Array(found))
            }
            "replication.run_onetime" => {
                let source = arg
                    .get("source_datasets")
                    .and_then(|s| s.get(0))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let short = text(&arg, "name_regex");
                let target = text(&arg, "target_dataset").to_string();
                let snapshot = format!("{}@{}", source, short);
                let referenced = *self
                    .snapshots
                    .get(&snapshot)
                    .ok_or_else(|| missing_snapshot(&snapshot))?;

                let states = self
                    .next_job_script
                    .take()
                    .unwrap_or_else(|| vec!["SUCCESS".to_string()]);
                if states.last().map(String::as_str) == Some("SUCCESS") {
                    self.datasets.entry(target.clone()).or_insert(FakeDataset {
                        refquota: 0,
                        available: 100 << 30,
                        origin: None,
                    });
                    self.snapshots.insert(format!("{}@{}", target, short), referenced);
                }
                Ok(json!(self.new_job(states)))
            }
            "core.get_jobs" => {
                let id = filter_value(params).and_then(Value::as_i64).unwrap_or_default();
                let Some(states) = self.jobs.get_mut(&id) else {
                    return Ok(json!([]));
                };
                let state = if states.len() > 1 {
                    states.pop_front().unwrap_or_default()
                } else {
                    states.front().cloned().unwrap_or_default()
                };
                let error = if state == "FAILED" {
                    json!(JOB_FAILURE)
                } else {
                    Value::Null
                };
                Ok(json!([{"id": id, "state": state, "result": null, "error": error}]))
            }
            other => Err(format!("[ENOMETHOD] Method {} not found", other)),
        }
    }
}

// =============================================================================
// Fake Appliance
// =============================================================================

/// Handle on one in-memory appliance; clones share the same state
#[derive(Clone, Default)]
pub struct FakeAppliance {
    state: Arc<Mutex<State>>,
}

impl FakeAppliance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> ConnectorRef {
        Arc::new(FakeConnector {
            state: self.state.clone(),
        })
    }

    /// A checked-out session on [`MODERN_URL`]
    pub async fn session(&self) -> Arc<Session> {
        let pool = ConnectionPool::new(
            PoolConfig::default(),
            self.connector(),
            ManualClock::new(),
            ControllerMetrics::new().unwrap(),
        );
        pool.acquire(MODERN_URL, &ApiKey::new(TEST_API_KEY), true)
            .await
            .unwrap()
    }

    // -------------------------------------------------------------------------
    // Connection control
    // -------------------------------------------------------------------------

    /// Channels opened so far
    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    /// Every open channel fails from now on
    pub fn kill_connections(&self) {
        self.state.lock().epoch += 1;
    }

    /// Refuse the legacy connect handshake
    pub fn reject_connect(&self) {
        self.state.lock().reject_connect = true;
    }

    /// Precede every response with an uncorrelated notification frame
    pub fn emit_notifications(&self, enabled: bool) {
        self.state.lock().notifications = enabled;
    }

    /// Methods called so far, login included
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    // -------------------------------------------------------------------------
    // Scripting
    // -------------------------------------------------------------------------

    pub fn seed_dataset(&self, name: &str, refquota: i64, available: i64) {
        self.state.lock().datasets.insert(
            name.to_string(),
            FakeDataset {
                refquota,
                available,
                origin: None,
            },
        );
    }

    /// Fail every call of `method` with `reason`
    pub fn fail_method(&self, method: &str, reason: &str) {
        self.state
            .lock()
            .failures
            .insert(method.to_string(), reason.to_string());
    }

    /// Fail only the next call of `method`
    pub fn fail_once(&self, method: &str, reason: &str) {
        self.state
            .lock()
            .failures_once
            .insert(method.to_string(), reason.to_string());
    }

    /// States reported by the next replication job; the last one sticks
    pub fn script_next_job(&self, states: &[&str]) {
        self.state.lock().next_job_script = Some(states.iter().map(|s| s.to_string()).collect());
    }

    /// Register a job reporting `states` in turn; the last one sticks
    pub fn script_job(&self, states: &[&str]) -> i64 {
        self.state
            .lock()
            .new_job(states.iter().map(|s| s.to_string()).collect())
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn has_dataset(&self, name: &str) -> bool {
        self.state.lock().datasets.contains_key(name)
    }

    pub fn refquota(&self, name: &str) -> Option<i64> {
        self.state.lock().datasets.get(name).map(|d| d.refquota)
    }

    pub fn has_snapshot(&self, full_name: &str) -> bool {
        self.state.lock().snapshots.contains_key(full_name)
    }

    /// Full names of the snapshots of `dataset`
    pub fn snapshots_of(&self, dataset: &str) -> Vec<String> {
        let prefix = format!("{}@", dataset);
        self.state
            .lock()
            .snapshots
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn has_share(&self, path: &str) -> bool {
        self.state
            .lock()
            .shares
            .iter()
            .any(|s| text(s, "path") == path)
    }
}

// =============================================================================
// Wire Doubles
// =============================================================================

struct FakeConnector {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _allow_insecure: bool,
    ) -> Result<Box<dyn WireChannel>, RpcError> {
        let epoch = {
            let mut state = self.state.lock();
            state.connections += 1;
            state.epoch
        };
        Ok(Box::new(FakeChannel {
            state: self.state.clone(),
            dialect: endpoint.dialect(),
            epoch,
            authenticated: false,
            outbox: VecDeque::new(),
        }))
    }
}

struct FakeChannel {
    state: Arc<Mutex<State>>,
    dialect: Dialect,
    epoch: u64,
    authenticated: bool,
    outbox: VecDeque<String>,
}

impl FakeChannel {
    fn alive(&self) -> Result<(), RpcError> {
        if self.state.lock().epoch == self.epoch {
            Ok(())
        } else {
            Err(RpcError::Closed)
        }
    }

    fn envelope(&self, id: &Value, reply: Reply) -> Value {
        match (self.dialect, reply) {
            (Dialect::Legacy, Ok(result)) => json!({"msg": "result", "id": id, "result": result}),
            (Dialect::Legacy, Err(reason)) => json!({
                "msg": "result",
                "id": id,
                "error": {"error": 22, "errname": "EINVAL", "type": "VALIDATION", "reason": reason},
            }),
            (Dialect::Modern, Ok(result)) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            (Dialect::Modern, Err(reason)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": -32001,
                    "message": "Method call error",
                    "data": {"error": 22, "errname": "EINVAL", "reason": reason},
                },
            }),
        }
    }

    fn notification(&self) -> Value {
        match self.dialect {
            Dialect::Legacy => json!({"msg": "added", "collection": "core.get_jobs", "fields": {}}),
            Dialect::Modern => json!({"jsonrpc": "2.0", "method": "collection_update", "params": {}}),
        }
    }
}

#[async_trait]
impl WireChannel for FakeChannel {
    async fn send_text(&mut self, frame: String) -> Result<(), RpcError> {
        self.alive()?;
        let request: Value = serde_json::from_str(&frame)?;

        if text(&request, "msg") == "connect" {
            let reply = if self.state.lock().reject_connect {
                json!({"msg": "failed", "version": "1"})
            } else {
                json!({"msg": "connected", "session": "fake-session"})
            };
            self.outbox.push_back(reply.to_string());
            return Ok(());
        }

        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = text(&request, "method").to_string();
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        let (reply, notify) = {
            let mut state = self.state.lock();
            state.calls.push(method.clone());
            let reply = if method == LOGIN_METHOD {
                let accepted = params.get(0).and_then(Value::as_str) == Some(TEST_API_KEY);
                self.authenticated = accepted;
                Ok(Value::Bool(accepted))
            } else if !self.authenticated {
                Err("[ENOTAUTHENTICATED] Not authenticated".to_string())
            } else {
                state.handle(&method, &params)
            };
            (reply, state.notifications)
        };

        if notify {
            self.outbox.push_back(self.notification().to_string());
        }
        self.outbox.push_back(self.envelope(&id, reply).to_string());
        Ok(())
    }

    async fn recv_text(&mut self) -> Result<String, RpcError> {
        self.alive()?;
        self.outbox
            .pop_front()
            .ok_or_else(|| RpcError::Channel("no frame pending".to_string()))
    }

    async fn ping(&mut self) -> Result<(), RpcError> {
        self.alive()
    }

    async fn close(&mut self) {}
}
