//! Connection Registry - Live Connection Pool Management
//!
//! Owns the set of live client connections and their health:
//!
//! - Bounded pool: `add` returns `false` when the pool is full
//! - Ping/pong bookkeeping and a periodic health sweep
//! - Purge callbacks so dependent state (session bindings) never outlives
//!   the connection it refers to
//! - Periodic resource telemetry with warning/critical alerts
//!
//! # Sweep
//!
//! ```text
//!   every heartbeat interval:
//!     stale = connections with an unanswered ping older than the timeout
//!           + connections that never pinged and are older than the timeout
//!     mark stale dead ──► purge dead ──► run purge callbacks (lock released)
//!     every N sweeps: sample memory / cpu / pool saturation ──► alert
//! ```
//!
//! # Thread Safety
//!
//! The connection map lives behind a single `RwLock`. Purge callbacks are
//! invoked only after that lock has been released, so a callback is free to
//! call into other components (or back into the registry).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::lifecycle::join_with_timeout;
use crate::session::SessionId;

mod resources;

pub use resources::{PressureLevel, ResourceMonitor, ResourceSample, ResourceThresholds};

// ============================================================================
// Identity and metadata
// ============================================================================

/// Opaque identifier of one live client connection
///
/// Usually supplied by the transport (a socket id); [`ConnectionId::generate`]
/// mints one when the transport has no natural id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap a transport-supplied identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh unique identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-supplied details about a connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    /// Remote address
    pub ip: Option<String>,
    /// User agent or client version string
    pub user_agent: Option<String>,
    /// Session this connection currently represents
    pub session_id: Option<SessionId>,
}

impl ConnectionMetadata {
    /// Set the remote address
    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Set the user agent
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// A live connection as tracked by the registry
#[derive(Debug, Clone)]
pub struct Connection {
    /// Connection identifier
    pub id: ConnectionId,
    /// Wall-clock connect time (for display)
    pub connected_at: DateTime<Utc>,
    /// Monotonic connect time (for health checks)
    pub created: Instant,
    /// Last ping sent to this connection
    pub last_ping: Option<Instant>,
    /// Last pong received from this connection
    pub last_pong: Option<Instant>,
    /// Cleared when the connection is found stale or reported dead
    pub alive: bool,
    /// Client metadata
    pub metadata: ConnectionMetadata,
    /// Messages recorded against this connection
    pub messages: u64,
    /// Bytes recorded against this connection
    pub bytes: u64,
}

impl Connection {
    fn new(id: ConnectionId, metadata: ConnectionMetadata) -> Self {
        Self {
            id,
            connected_at: Utc::now(),
            created: Instant::now(),
            last_ping: None,
            last_pong: None,
            alive: true,
            metadata,
            messages: 0,
            bytes: 0,
        }
    }

    /// Time since the connection was added
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Whether the connection has gone quiet for longer than `timeout`
    ///
    /// A connection that has been pinged is stale when no pong at or after
    /// that ping has arrived and the ping is older than `timeout`, or when
    /// the ping was answered but that pong is older than `timeout`. A
    /// connection that has never been pinged is stale once it is older than
    /// `timeout`.
    #[must_use]
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        match self.last_ping {
            Some(ping) => match self.last_pong.filter(|pong| *pong >= ping) {
                Some(pong) => now.saturating_duration_since(pong) > timeout,
                None => now.saturating_duration_since(ping) > timeout,
            },
            None => now.saturating_duration_since(self.created) > timeout,
        }
    }

    fn summary(&self, now: Instant) -> ConnectionSummary {
        ConnectionSummary {
            id: self.id.clone(),
            connected_at: self.connected_at,
            duration_secs: now.saturating_duration_since(self.created).as_secs(),
            session_id: self.metadata.session_id.clone(),
            last_ping_secs_ago: self
                .last_ping
                .map(|t| now.saturating_duration_since(t).as_secs()),
            last_pong_secs_ago: self
                .last_pong
                .map(|t| now.saturating_duration_since(t).as_secs()),
            messages: self.messages,
            bytes: self.bytes,
        }
    }
}

// ============================================================================
// Configuration and snapshots
// ============================================================================

/// Registry configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Pool capacity
    pub max_connections: usize,
    /// Interval between health sweeps (seconds)
    pub heartbeat_interval_secs: u64,
    /// Silence after which a connection is considered stale (seconds)
    pub stale_timeout_secs: u64,
    /// Sample resources every this many sweeps (0 = never)
    pub resource_sample_every: u64,
    /// Alert bands for resource samples
    pub thresholds: ResourceThresholds,
    /// How long `stop()` waits for the sweep task (milliseconds)
    pub shutdown_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            heartbeat_interval_secs: 30,
            stale_timeout_secs: 30,
            resource_sample_every: 10,
            thresholds: ResourceThresholds::default(),
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl RegistryConfig {
    /// Sweep interval, never shorter than one second
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Staleness timeout
    #[must_use]
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }
}

/// One active connection in a [`RegistrySnapshot`]
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    /// Connection identifier
    pub id: ConnectionId,
    /// Wall-clock connect time
    pub connected_at: DateTime<Utc>,
    /// Seconds since connect
    pub duration_secs: u64,
    /// Session the connection represents, if any
    pub session_id: Option<SessionId>,
    /// Seconds since the last ping
    pub last_ping_secs_ago: Option<u64>,
    /// Seconds since the last pong
    pub last_pong_secs_ago: Option<u64>,
    /// Messages recorded
    pub messages: u64,
    /// Bytes recorded
    pub bytes: u64,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    /// Number of live connections
    pub count: usize,
    /// Pool capacity
    pub max_connections: usize,
    /// Connections accepted since start
    pub total_served: u64,
    /// Connections rejected because the pool was full
    pub rejected: u64,
    /// Connections removed by the health sweep or explicit removal
    pub purged: u64,
    /// The live connections
    pub connections: Vec<ConnectionSummary>,
}

/// Outcome of one health sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Connections found stale and marked dead
    pub stale: Vec<ConnectionId>,
    /// Connections physically removed
    pub purged: Vec<ConnectionId>,
    /// Resource sample, on sampling sweeps
    pub sample: Option<ResourceSample>,
}

/// Callback run for every connection leaving the registry
pub type PurgeCallback = Arc<dyn Fn(&ConnectionId) + Send + Sync>;

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
struct Counters {
    total_served: AtomicU64,
    rejected: AtomicU64,
    purged: AtomicU64,
    sweeps: AtomicU64,
}

struct RegistryInner {
    config: RegistryConfig,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    callbacks: RwLock<Vec<PurgeCallback>>,
    counters: Counters,
    monitor: Mutex<ResourceMonitor>,
    alerts: broadcast::Sender<ResourceSample>,
    running: AtomicBool,
    shutdown: Notify,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Registry of live connections
///
/// Cheap to clone; all clones share the same pool.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl ConnectionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        let (alerts, _) = broadcast::channel(16);
        let monitor = ResourceMonitor::new(config.thresholds.clone());
        Self {
            inner: Arc::new(RegistryInner {
                config,
                connections: RwLock::new(HashMap::new()),
                callbacks: RwLock::new(Vec::new()),
                counters: Counters::default(),
                monitor: Mutex::new(monitor),
                alerts,
                running: AtomicBool::new(false),
                shutdown: Notify::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Registry configuration
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Add a connection
    ///
    /// Returns `false` when the pool is at capacity. Re-adding an id that is
    /// already present replaces its entry and never counts against capacity.
    pub fn add(&self, id: ConnectionId, metadata: ConnectionMetadata) -> bool {
        let mut connections = self.inner.connections.write();
        let replacing = connections.contains_key(&id);

        if !replacing && connections.len() >= self.inner.config.max_connections {
            drop(connections);
            self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                connection_id = %id,
                max_connections = self.inner.config.max_connections,
                "Connection pool full, rejecting connection"
            );
            return false;
        }

        connections.insert(id.clone(), Connection::new(id.clone(), metadata));
        let active = connections.len();
        drop(connections);

        self.inner
            .counters
            .total_served
            .fetch_add(1, Ordering::Relaxed);
        if replacing {
            tracing::warn!(connection_id = %id, "Connection already registered, replaced");
        } else {
            tracing::info!(connection_id = %id, active, "Connection added");
        }
        true
    }

    /// Remove a connection
    ///
    /// Purge callbacks run for the removed connection. Returns `false` if the
    /// connection was not registered.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        let removed = self.inner.connections.write().remove(id);
        match removed {
            Some(connection) => {
                tracing::info!(
                    connection_id = %id,
                    duration_secs = connection.age().as_secs(),
                    "Connection removed"
                );
                self.inner.counters.purged.fetch_add(1, Ordering::Relaxed);
                self.run_callbacks(std::slice::from_ref(id));
                true
            }
            None => {
                tracing::debug!(connection_id = %id, "Attempted to remove unknown connection");
                false
            }
        }
    }

    /// Get a copy of a connection's state
    #[must_use]
    pub fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.inner.connections.read().get(id).cloned()
    }

    /// Whether a connection is registered
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.connections.read().contains_key(id)
    }

    /// Number of registered connections (alive or awaiting purge)
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.connections.read().len()
    }

    /// Record a ping sent to a connection
    pub fn update_ping(&self, id: &ConnectionId) {
        self.with_connection(id, |connection| connection.last_ping = Some(Instant::now()));
    }

    /// Record a pong received from a connection
    pub fn update_pong(&self, id: &ConnectionId) {
        self.with_connection(id, |connection| connection.last_pong = Some(Instant::now()));
    }

    /// Mark a connection dead; it is removed on the next purge
    pub fn mark_dead(&self, id: &ConnectionId) {
        if self.with_connection(id, |connection| connection.alive = false) {
            tracing::warn!(connection_id = %id, "Connection marked dead");
        }
    }

    /// Record traffic against a connection
    pub fn record_message(&self, id: &ConnectionId, bytes: u64) {
        self.with_connection(id, |connection| {
            connection.messages += 1;
            connection.bytes += bytes;
        });
    }

    /// Record which session a connection represents
    pub fn attach_session(&self, id: &ConnectionId, session_id: SessionId) {
        self.with_connection(id, |connection| {
            connection.metadata.session_id = Some(session_id);
        });
    }

    fn with_connection(&self, id: &ConnectionId, f: impl FnOnce(&mut Connection)) -> bool {
        match self.inner.connections.write().get_mut(id) {
            Some(connection) => {
                f(connection);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the live connections
    #[must_use]
    pub fn list_active(&self) -> RegistrySnapshot {
        let now = Instant::now();
        let connections = self.inner.connections.read();
        let mut active: Vec<ConnectionSummary> = connections
            .values()
            .filter(|c| c.alive)
            .map(|c| c.summary(now))
            .collect();
        drop(connections);
        active.sort_by(|a, b| a.id.cmp(&b.id));

        RegistrySnapshot {
            count: active.len(),
            max_connections: self.inner.config.max_connections,
            total_served: self.inner.counters.total_served.load(Ordering::Relaxed),
            rejected: self.inner.counters.rejected.load(Ordering::Relaxed),
            purged: self.inner.counters.purged.load(Ordering::Relaxed),
            connections: active,
        }
    }

    /// Connections that are alive but stale under `timeout`
    #[must_use]
    pub fn stale_connections(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        self.inner
            .connections
            .read()
            .values()
            .filter(|c| c.alive && c.is_stale(now, timeout))
            .map(|c| c.id.clone())
            .collect()
    }

    /// Remove every dead connection and run purge callbacks for each
    pub fn purge_dead(&self) -> Vec<ConnectionId> {
        let purged: Vec<ConnectionId> = {
            let mut connections = self.inner.connections.write();
            let dead: Vec<ConnectionId> = connections
                .values()
                .filter(|c| !c.alive)
                .map(|c| c.id.clone())
                .collect();
            for id in &dead {
                connections.remove(id);
            }
            dead
        };

        if !purged.is_empty() {
            self.inner
                .counters
                .purged
                .fetch_add(purged.len() as u64, Ordering::Relaxed);
            tracing::info!(count = purged.len(), "Purged dead connections");
            self.run_callbacks(&purged);
        }
        purged
    }

    /// Register a callback run for every connection that leaves the registry
    pub fn on_purge<F>(&self, callback: F)
    where
        F: Fn(&ConnectionId) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().push(Arc::new(callback));
    }

    fn run_callbacks(&self, ids: &[ConnectionId]) {
        let callbacks: Vec<PurgeCallback> = self.inner.callbacks.read().clone();
        for id in ids {
            for callback in &callbacks {
                callback(id);
            }
        }
    }

    /// Subscribe to resource samples
    ///
    /// Every sample is published, including `Normal` ones, so subscribers can
    /// tell when pressure has cleared.
    #[must_use]
    pub fn subscribe_resources(&self) -> broadcast::Receiver<ResourceSample> {
        self.inner.alerts.subscribe()
    }

    /// Sample process resources and pool saturation now
    pub fn sample_resources(&self) -> ResourceSample {
        let max = self.inner.config.max_connections.max(1);
        #[allow(clippy::cast_precision_loss)]
        let saturation = self.count() as f64 / max as f64 * 100.0;
        let sample = self.inner.monitor.lock().sample(saturation);

        match sample.level {
            PressureLevel::Normal => tracing::debug!(
                memory_mb = sample.process_memory_mb,
                cpu_percent = sample.process_cpu_percent,
                saturation_percent = sample.pool_saturation_percent,
                "Resource sample"
            ),
            PressureLevel::Warning => tracing::warn!(
                memory_mb = sample.process_memory_mb,
                cpu_percent = sample.process_cpu_percent,
                saturation_percent = sample.pool_saturation_percent,
                reasons = ?sample.reasons,
                "Resource pressure warning"
            ),
            PressureLevel::Critical => tracing::error!(
                memory_mb = sample.process_memory_mb,
                cpu_percent = sample.process_cpu_percent,
                saturation_percent = sample.pool_saturation_percent,
                reasons = ?sample.reasons,
                "Resource pressure critical"
            ),
        }

        // No subscribers is fine
        let _ = self.inner.alerts.send(sample.clone());
        sample
    }

    /// Run one health sweep
    pub fn sweep(&self) -> SweepReport {
        let stale = self.stale_connections(self.inner.config.stale_timeout());
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "Found stale connections");
            for id in &stale {
                self.mark_dead(id);
            }
        }

        let purged = self.purge_dead();

        let sweeps = self.inner.counters.sweeps.fetch_add(1, Ordering::Relaxed) + 1;
        let every = self.inner.config.resource_sample_every;
        let sample = (every > 0 && sweeps % every == 0).then(|| self.sample_resources());

        SweepReport {
            stale,
            purged,
            sample,
        }
    }

    /// Start the periodic health sweep
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let registry = self.clone();
        let interval = self.inner.config.heartbeat_interval();
        let handle = tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "Connection health sweep started");
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            while registry.inner.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep();
                    }
                    () = registry.inner.shutdown.notified() => {}
                }
            }
            tracing::info!("Connection health sweep stopped");
        });
        *self.inner.sweeper.lock() = Some(handle);
    }

    /// Stop the health sweep
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.notify_one();

        let handle = self.inner.sweeper.lock().take();
        if let Some(handle) = handle {
            join_with_timeout(
                "registry",
                vec![handle],
                Duration::from_millis(self.inner.config.shutdown_timeout_ms),
            )
            .await;
        }
    }

    /// Whether the health sweep is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let connections = self.inner.connections.read();
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &connections.len())
            .field("max_connections", &self.inner.config.max_connections)
            .finish()
    }
}
