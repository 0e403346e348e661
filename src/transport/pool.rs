//! Connection Pool
//!
//! Owns authenticated sessions keyed by endpoint URL. Sessions are lent to
//! exactly one borrower at a time; idle ones are probed with a keepalive
//! write before reuse and closed by a background reclaimer once they have
//! been idle longer than the configured threshold.
//!
//! Workflows borrow sessions through a [`SessionLease`]. A lease dropped
//! without [`SessionLease::release`], for example when the caller's future is
//! cancelled mid-exchange, closes its session rather than returning it, since
//! the channel may still carry the reply to an abandoned request.
//!
//! A keepalive write only proves the write side of the socket is alive. A
//! peer that half-closed its read side is detected on the next call instead.

use super::endpoint::{Dialect, Endpoint};
use super::rpc;
use crate::domain::ports::{ApiKey, ClockRef, ConnectorRef, WireChannel};
use crate::error::{Error, Result};
use crate::metrics::ControllerMetrics;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Bound on socket open, legacy connect message and login
    pub handshake_timeout: Duration,
    /// Bound on a single request/response exchange
    pub call_timeout: Duration,
    /// Sessions idle longer than this are closed by the reclaimer
    pub max_idle: Duration,
    /// Reclaimer period
    pub reclaim_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(60),
            max_idle: Duration::from_secs(600),
            reclaim_interval: Duration::from_secs(600),
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// Mutable part of a session, guarded by the session's own lock
pub(crate) struct SessionState {
    pub(crate) channel: Option<Box<dyn WireChannel>>,
    pub(crate) in_use: bool,
    pub(crate) last_active: DateTime<Utc>,
}

/// One authenticated connection to one appliance endpoint
pub struct Session {
    id: u64,
    endpoint: Endpoint,
    call_timeout: Duration,
    clock: ClockRef,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn dialect(&self) -> Dialect {
        self.endpoint.dialect()
    }

    pub(crate) fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Exclusive access to the channel for one exchange
    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    pub async fn last_active(&self) -> DateTime<Utc> {
        self.state.lock().await.last_active
    }

    pub async fn is_in_use(&self) -> bool {
        self.state.lock().await.in_use
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.url())
            .field("dialect", &self.endpoint.dialect())
            .finish()
    }
}

/// Keepalive probe. A session without a channel is dead.
async fn probe(state: &mut SessionState) -> bool {
    match state.channel.as_mut() {
        Some(channel) => match channel.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Keepalive probe failed: {}", e);
                false
            }
        },
        None => false,
    }
}

async fn shutdown(state: &mut SessionState) {
    if let Some(mut channel) = state.channel.take() {
        channel.close().await;
    }
}

// =============================================================================
// Session Lease
// =============================================================================

/// A checked-out session that goes back to its pool when released or dropped
pub struct SessionLease {
    pool: Arc<ConnectionPool>,
    session: Arc<Session>,
    released: bool,
}

impl SessionLease {
    /// Return the session for reuse
    pub async fn release(mut self) {
        self.pool.release(Arc::clone(&self.session)).await;
        self.released = true;
    }
}

impl Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let session = Arc::clone(&self.session);
        warn!(
            endpoint = %session.endpoint,
            session = session.id,
            "Session abandoned mid-workflow, closing it"
        );
        // an unlocked state means no exchange is in flight
        if let Ok(mut state) = session.state.try_lock() {
            state.in_use = false;
            state.channel = None;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let pool = Arc::clone(&self.pool);
                runtime.spawn(async move { pool.discard(&session).await });
            }
            Err(_) => debug!(session = session.id, "No runtime, leaving the session to the reclaimer"),
        }
    }
}

// =============================================================================
// Connection Pool
// =============================================================================

/// Pool of sessions keyed by endpoint URL
pub struct ConnectionPool {
    config: PoolConfig,
    connector: ConnectorRef,
    clock: ClockRef,
    metrics: Arc<ControllerMetrics>,
    sessions: Mutex<HashMap<String, Vec<Arc<Session>>>>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    /// Create a new pool
    pub fn new(
        config: PoolConfig,
        connector: ConnectorRef,
        clock: ClockRef,
        metrics: Arc<ControllerMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            connector,
            clock,
            metrics,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out a session for `url`, reusing a live idle one when possible
    pub async fn acquire(
        &self,
        url: &str,
        api_key: &ApiKey,
        allow_insecure: bool,
    ) -> Result<Arc<Session>> {
        if let Some(session) = self.reuse_idle(url).await {
            return Ok(session);
        }

        let endpoint = Endpoint::parse(url)?;
        let session = Arc::new(self.open(endpoint, api_key, allow_insecure).await?);

        self.sessions
            .lock()
            .await
            .entry(url.to_string())
            .or_default()
            .push(session.clone());
        self.metrics.session_opened();

        info!(
            endpoint = %url,
            session = session.id,
            "Opened appliance session"
        );
        Ok(session)
    }

    /// Check out a session wrapped in a [`SessionLease`]
    pub async fn lease(
        self: &Arc<Self>,
        url: &str,
        api_key: &ApiKey,
        allow_insecure: bool,
    ) -> Result<SessionLease> {
        let session = self.acquire(url, api_key, allow_insecure).await?;
        Ok(SessionLease {
            pool: Arc::clone(self),
            session,
            released: false,
        })
    }

    /// Return a session to the pool. Dead sessions are closed and dropped.
    pub async fn release(&self, session: Arc<Session>) {
        let alive = {
            let mut state = session.state.lock().await;
            state.in_use = false;
            state.last_active = self.clock.now();
            let alive = probe(&mut state).await;
            if !alive {
                shutdown(&mut state).await;
            }
            alive
        };

        if !alive {
            self.forget(&session).await;
            self.metrics.session_discarded();
            warn!(
                endpoint = %session.endpoint,
                session = session.id,
                "Closed dead session on release"
            );
        }
    }

    /// Close sessions idle longer than `max_idle`. Checked-out sessions are kept.
    pub async fn reclaim_idle(&self) -> usize {
        let now = self.clock.now();
        let mut reclaimed = 0;
        let mut sessions = self.sessions.lock().await;

        for (url, list) in sessions.iter_mut() {
            let mut kept = Vec::with_capacity(list.len());
            for session in list.drain(..) {
                let expired = match session.state.try_lock() {
                    Ok(mut state) => {
                        let idle = (now - state.last_active).to_std().unwrap_or(Duration::ZERO);
                        let keep = state.in_use
                            || (state.channel.is_some() && idle <= self.config.max_idle);
                        if !keep {
                            debug!(endpoint = %url, session = session.id, ?idle, "Closing idle session");
                            shutdown(&mut state).await;
                        }
                        !keep
                    }
                    Err(_) => false,
                };
                if expired {
                    reclaimed += 1;
                } else {
                    kept.push(session);
                }
            }
            *list = kept;
        }
        sessions.retain(|_, list| !list.is_empty());

        if reclaimed > 0 {
            self.metrics.sessions_reclaimed(reclaimed as u64);
            info!("Reclaimed {} idle sessions", reclaimed);
        }
        reclaimed
    }

    /// Run [`Self::reclaim_idle`] every `reclaim_interval` until cancelled
    pub fn spawn_reclaimer(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                "Sessions checked every {:?}, closed after {:?} idle",
                pool.config.reclaim_interval, pool.config.max_idle
            );
            let mut ticker = tokio::time::interval(pool.config.reclaim_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Session reclaimer stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        pool.reclaim_idle().await;
                    }
                }
            }
        })
    }

    /// Number of pooled sessions for `url`
    pub async fn session_count(&self, url: &str) -> usize {
        self.sessions
            .lock()
            .await
            .get(url)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn reuse_idle(&self, url: &str) -> Option<Arc<Session>> {
        let candidates = self.sessions.lock().await.get(url).cloned().unwrap_or_default();

        let mut dead = Vec::new();
        let mut found = None;
        for session in candidates {
            let alive = match session.state.try_lock() {
                Ok(mut state) if !state.in_use => {
                    if probe(&mut state).await {
                        state.in_use = true;
                        state.last_active = self.clock.now();
                        Some(true)
                    } else {
                        shutdown(&mut state).await;
                        Some(false)
                    }
                }
                _ => None,
            };
            match alive {
                Some(true) => {
                    found = Some(session);
                    break;
                }
                Some(false) => dead.push(session),
                None => {}
            }
        }

        for session in &dead {
            self.forget(session).await;
            self.metrics.session_discarded();
            debug!(endpoint = %url, session = session.id, "Dropped dead idle session");
        }

        if let Some(session) = &found {
            self.metrics.session_reused();
            debug!(endpoint = %url, session = session.id, "Reusing idle session");
        }
        found
    }

    async fn open(&self, endpoint: Endpoint, api_key: &ApiKey, allow_insecure: bool) -> Result<Session> {
        let timeout = self.config.handshake_timeout;
        let handshake_error = |reason: String| Error::Handshake {
            endpoint: endpoint.url().to_string(),
            reason,
        };

        let mut channel = tokio::time::timeout(timeout, self.connector.connect(&endpoint, allow_insecure))
            .await
            .map_err(|_| handshake_error(format!("no connection within {:?}", timeout)))?
            .map_err(|e| handshake_error(e.to_string()))?;

        if endpoint.dialect() == Dialect::Legacy {
            if let Err(e) = rpc::connect_handshake(channel.as_mut(), timeout).await {
                channel.close().await;
                return Err(handshake_error(e.to_string()));
            }
        }

        if let Err(e) = rpc::login(channel.as_mut(), &endpoint, api_key, timeout).await {
            channel.close().await;
            return Err(e);
        }

        Ok(Session {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            endpoint,
            call_timeout: self.config.call_timeout,
            clock: self.clock.clone(),
            state: Mutex::new(SessionState {
                channel: Some(channel),
                in_use: true,
                last_active: self.clock.now(),
            }),
        })
    }

    /// Close a session whose borrower went away and drop it from the pool
    async fn discard(&self, session: &Session) {
        {
            let mut state = session.state.lock().await;
            state.in_use = false;
            shutdown(&mut state).await;
        }
        if self.forget(session).await {
            self.metrics.session_discarded();
            debug!(endpoint = %session.endpoint, session = session.id, "Discarded abandoned session");
        }
    }

    /// Remove a session from the pool; `false` if it was already gone
    async fn forget(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(list) = sessions.get_mut(session.endpoint.url()) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != session.id);
        let removed = list.len() < before;
        if list.is_empty() {
            sessions.remove(session.endpoint.url());
        }
        removed
    }
}
