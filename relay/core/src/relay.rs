//! Relay - Explicit Wiring of the Relay Components
//!
//! Builds the registry, router, outbound queue, processor and cache from one
//! [`RelayConfig`] and connects them:
//!
//! ```text
//!   registry purge ──► router.unbind        (bindings never outlive connections)
//!   processor result ──► queue.enqueue      (HIGH, addressed by session)
//!   queue delivery ──► router.resolve ──► transport.push
//!   resource sample ──► cache degradation   (when follow_pressure is set)
//! ```
//!
//! Every component is also reachable on its own through the accessors, for
//! embedders that need finer control (ping/pong bookkeeping, delivery
//! acknowledgements, cache tuning).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use crate::backend::AnalyzerFactory;
use crate::cache::{CacheStats, SimilarityCache};
use crate::config::RelayConfig;
use crate::lifecycle::join_with_timeout;
use crate::outbound::{MessageQueue, QueueStats, Transport};
use crate::processor::{BackgroundProcessor, ProcessorError, ProcessorStats};
use crate::registry::{
    ConnectionId, ConnectionMetadata, ConnectionRegistry, PressureLevel, RegistrySnapshot,
    ResourceSample,
};
use crate::scheduling::Priority;
use crate::session::{RouterStats, SessionId, SessionRouter};
use crate::tasks::{AnalysisRequest, TaskId};

/// Errors from admitting a connection
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The connection pool is at capacity
    #[error("connection pool full ({max_connections} connections)")]
    PoolFull {
        /// Pool capacity
        max_connections: usize,
    },

    /// The session could not be bound to the connection
    #[error("failed to bind session {0}")]
    BindFailed(SessionId),
}

/// Statistics of every component
#[derive(Clone, Debug, Serialize)]
pub struct RelayStats {
    /// Connection pool
    pub connections: RegistrySnapshot,
    /// Sessions and bindings
    pub sessions: RouterStats,
    /// Outbound delivery
    pub queue: QueueStats,
    /// Analysis workers
    pub processor: ProcessorStats,
    /// Result cache
    pub cache: CacheStats,
}

struct Follower {
    running: AtomicBool,
    shutdown: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// The assembled relay
///
/// Cheap to clone; all clones share the same components.
#[derive(Clone)]
pub struct Relay {
    config: Arc<RelayConfig>,
    registry: ConnectionRegistry,
    router: SessionRouter,
    queue: MessageQueue,
    processor: BackgroundProcessor,
    cache: SimilarityCache,
    follower: Arc<Follower>,
}

impl Relay {
    /// Build every component; nothing is started
    pub fn new(
        config: RelayConfig,
        factory: Arc<dyn AnalyzerFactory>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let registry = ConnectionRegistry::new(config.registry.clone());
        let router = SessionRouter::new(config.router.clone());
        let cache = SimilarityCache::new(config.cache.clone());
        let queue = MessageQueue::new(
            config.queue.clone(),
            config.retry.clone(),
            router.clone(),
            transport,
        );
        let processor = BackgroundProcessor::new(
            config.processor.clone(),
            config.retry.clone(),
            factory,
            cache.clone(),
            queue.clone(),
        );

        let unbinder = router.clone();
        registry.on_purge(move |connection_id| {
            unbinder.unbind(connection_id);
        });

        Self {
            config: Arc::new(config),
            registry,
            router,
            queue,
            processor,
            cache,
            follower: Arc::new(Follower {
                running: AtomicBool::new(false),
                shutdown: Notify::new(),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Configuration the relay was built from
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Connection registry
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Session router
    #[must_use]
    pub fn router(&self) -> &SessionRouter {
        &self.router
    }

    /// Outbound message queue
    #[must_use]
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Background processor
    #[must_use]
    pub fn processor(&self) -> &BackgroundProcessor {
        &self.processor
    }

    /// Similarity cache
    #[must_use]
    pub fn cache(&self) -> &SimilarityCache {
        &self.cache
    }

    /// Admit a connection and bind it to a session
    ///
    /// With `resume` set to a live session, the connection takes over that
    /// session and anything still queued for it is delivered here. An
    /// unknown or expired `resume` falls back to a fresh session.
    ///
    /// # Errors
    ///
    /// `PoolFull` when the registry is at capacity. `BindFailed` if the
    /// session vanished between creation and binding; the connection is
    /// removed again in that case.
    pub fn connect(
        &self,
        connection_id: ConnectionId,
        metadata: ConnectionMetadata,
        resume: Option<SessionId>,
    ) -> Result<SessionId, ConnectError> {
        if !self.registry.add(connection_id.clone(), metadata) {
            return Err(ConnectError::PoolFull {
                max_connections: self.registry.config().max_connections,
            });
        }

        if let Some(session_id) = resume {
            if self.router.bind(&session_id, connection_id.clone()) {
                self.registry.attach_session(&connection_id, session_id.clone());
                tracing::info!(
                    connection_id = %connection_id,
                    session_id = %session_id,
                    "Connection resumed session"
                );
                return Ok(session_id);
            }
            tracing::info!(
                connection_id = %connection_id,
                session_id = %session_id,
                "Resume target unavailable, issuing a new session"
            );
        }

        let session_id = self.router.create();
        if !self.router.bind(&session_id, connection_id.clone()) {
            self.registry.remove(&connection_id);
            return Err(ConnectError::BindFailed(session_id));
        }
        self.registry.attach_session(&connection_id, session_id.clone());
        tracing::info!(connection_id = %connection_id, session_id = %session_id, "Client connected");
        Ok(session_id)
    }

    /// Remove a connection; its session stays alive for a later resume
    pub fn disconnect(&self, connection_id: &ConnectionId) -> bool {
        let removed = self.registry.remove(connection_id);
        if removed {
            tracing::info!(connection_id = %connection_id, "Client disconnected");
        }
        removed
    }

    /// Submit analysis work, attributing activity to its session
    ///
    /// # Errors
    ///
    /// Propagates the processor's validation and capacity errors.
    pub fn submit(
        &self,
        request: AnalysisRequest,
        priority: Priority,
    ) -> Result<TaskId, ProcessorError> {
        if let Some(session_id) = &request.session_id {
            if !self.router.touch(session_id) {
                tracing::debug!(
                    session_id = %session_id,
                    "Submission for unknown or expired session, result will not be delivered"
                );
            }
        }
        self.processor.enqueue(request, priority)
    }

    /// Statistics of every component
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            connections: self.registry.list_active(),
            sessions: self.router.stats(),
            queue: self.queue.stats(),
            processor: self.processor.stats(),
            cache: self.cache.stats(),
        }
    }

    /// Start the delivery worker, the analysis workers, the health sweep
    /// and, if configured, the pressure follower
    pub fn start(&self) {
        self.queue.start();
        self.processor.start();
        self.registry.start();
        if self.config.follow_pressure {
            self.start_follower();
        }
        tracing::info!("Relay started");
    }

    /// Stop everything started by [`Relay::start`]
    pub async fn stop(&self) {
        self.stop_follower().await;
        self.registry.stop().await;
        self.processor.stop().await;
        self.queue.stop().await;
        tracing::info!("Relay stopped");
    }

    fn start_follower(&self) {
        if self.follower.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut samples = self.registry.subscribe_resources();
        let cache = self.cache.clone();
        let follower = Arc::clone(&self.follower);

        let handle = tokio::spawn(async move {
            tracing::debug!("Pressure follower started");
            while follower.running.load(Ordering::SeqCst) {
                tokio::select! {
                    received = samples.recv() => match received {
                        Ok(sample) => follow_sample(&cache, &sample),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::debug!(missed, "Pressure follower lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    () = follower.shutdown.notified() => {}
                }
            }
            tracing::debug!("Pressure follower stopped");
        });
        *self.follower.handle.lock() = Some(handle);
    }

    async fn stop_follower(&self) {
        if !self.follower.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.follower.shutdown.notify_one();
        let handle = self.follower.handle.lock().take();
        if let Some(handle) = handle {
            join_with_timeout("pressure-follower", vec![handle], Duration::from_secs(1)).await;
        }
    }
}

fn follow_sample(cache: &SimilarityCache, sample: &ResourceSample) {
    match sample.level {
        PressureLevel::Critical => {
            if cache.enter_degradation_mode() {
                tracing::warn!(reasons = ?sample.reasons, "Cache degraded under resource pressure");
            }
        }
        PressureLevel::Normal => {
            if cache.exit_degradation_mode() {
                tracing::info!("Resource pressure cleared, cache restored");
            }
        }
        PressureLevel::Warning => {}
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::backend::{Analyzer, AnalyzerError};
    use crate::outbound::ChannelTransport;
    use crate::registry::ResourceThresholds;

    struct Echo;

    #[async_trait]
    impl Analyzer for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn analyze(&self, text: &str) -> Result<Value, AnalyzerError> {
            Ok(json!({ "echo": text }))
        }
    }

    fn relay_with(config: RelayConfig) -> (Relay, ChannelTransport) {
        let transport = ChannelTransport::default();
        let factory: Arc<dyn AnalyzerFactory> =
            Arc::new(|| Arc::new(Echo) as Arc<dyn Analyzer>);
        let relay = Relay::new(config, factory, Arc::new(transport.clone()));
        (relay, transport)
    }

    #[tokio::test]
    async fn test_connect_binds_fresh_session() {
        let (relay, _) = relay_with(RelayConfig::default());
        let cid = ConnectionId::from("c1");

        let sid = relay
            .connect(cid.clone(), ConnectionMetadata::default(), None)
            .unwrap();

        assert_eq!(relay.router().resolve_connection(&sid), Some(cid.clone()));
        assert_eq!(
            relay.registry().get(&cid).unwrap().metadata.session_id,
            Some(sid)
        );
    }

    #[tokio::test]
    async fn test_connect_resumes_live_session() {
        let (relay, _) = relay_with(RelayConfig::default());
        let first = ConnectionId::from("c1");
        let second = ConnectionId::from("c2");

        let sid = relay
            .connect(first.clone(), ConnectionMetadata::default(), None)
            .unwrap();
        relay.disconnect(&first);
        let resumed = relay
            .connect(second.clone(), ConnectionMetadata::default(), Some(sid.clone()))
            .unwrap();

        assert_eq!(resumed, sid);
        assert_eq!(relay.router().resolve_connection(&sid), Some(second));
    }

    #[tokio::test]
    async fn test_unknown_resume_gets_new_session() {
        let (relay, _) = relay_with(RelayConfig::default());
        let stale = SessionId::from("gone");
        let sid = relay
            .connect(ConnectionId::from("c1"), ConnectionMetadata::default(), Some(stale.clone()))
            .unwrap();
        assert_ne!(sid, stale);
    }

    #[tokio::test]
    async fn test_pool_full_is_reported() {
        let mut config = RelayConfig::default();
        config.registry.max_connections = 1;
        let (relay, _) = relay_with(config);

        relay
            .connect(ConnectionId::from("c1"), ConnectionMetadata::default(), None)
            .unwrap();
        let err = relay
            .connect(ConnectionId::from("c2"), ConnectionMetadata::default(), None)
            .unwrap_err();

        assert_eq!(err, ConnectError::PoolFull { max_connections: 1 });
        assert_eq!(relay.router().stats().total_sessions, 1);
    }

    #[tokio::test]
    async fn test_disconnect_unbinds_but_keeps_session() {
        let (relay, _) = relay_with(RelayConfig::default());
        let cid = ConnectionId::from("c1");
        let sid = relay
            .connect(cid.clone(), ConnectionMetadata::default(), None)
            .unwrap();

        assert!(relay.disconnect(&cid));
        assert!(!relay.disconnect(&cid));
        assert_eq!(relay.router().resolve_connection(&sid), None);
        assert_eq!(relay.router().resolve_session(&cid), None);
        assert!(relay.router().get(&sid).is_some());
    }

    #[tokio::test]
    async fn test_pressure_follower_degrades_and_restores_cache() {
        let mut config = RelayConfig::default();
        config.follow_pressure = true;
        config.registry.max_connections = 2;
        config.registry.resource_sample_every = 0;
        config.registry.thresholds = ResourceThresholds {
            memory_warning_mb: f64::MAX,
            memory_critical_mb: f64::MAX,
            cpu_warning_percent: f32::MAX,
            cpu_critical_percent: f32::MAX,
            saturation_warning_percent: 40.0,
            saturation_critical_percent: 90.0,
        };
        let (relay, _) = relay_with(config);
        relay.start();

        for id in ["c1", "c2"] {
            relay
                .connect(ConnectionId::from(id), ConnectionMetadata::default(), None)
                .unwrap();
        }
        assert_eq!(relay.registry().sample_resources().level, PressureLevel::Critical);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !relay.cache().is_degraded() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        relay.disconnect(&ConnectionId::from("c1"));
        relay.disconnect(&ConnectionId::from("c2"));
        assert_eq!(relay.registry().sample_resources().level, PressureLevel::Normal);
        tokio::time::timeout(Duration::from_secs(2), async {
            while relay.cache().is_degraded() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        relay.stop().await;
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (relay, _) = relay_with(RelayConfig::default());
        relay.start();
        assert!(relay.processor().is_running());
        assert!(relay.queue().is_running());
        assert!(relay.registry().is_running());

        relay.stop().await;
        assert!(!relay.processor().is_running());
        assert!(!relay.queue().is_running());
        assert!(!relay.registry().is_running());
    }
}
