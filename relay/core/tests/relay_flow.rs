//! End-to-end tests of the assembled relay
//!
//! These tests drive a [`Relay`] through its public surface only:
//! - Submit, analyze, deliver and acknowledge
//! - Results follow a session across a reconnect
//! - Cache hits on repeated and near-duplicate submissions
//! - Permanent analysis failure delivers an error event
//! - Pool capacity and health-sweep purges keep bindings consistent

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use relay_core::{
    AnalysisRequest, Analyzer, AnalyzerError, AnalyzerFactory, ChannelTransport, ConnectError,
    ConnectionId, ConnectionMetadata, MessageId, OutboundEvent, Priority, Relay, RelayConfig,
    RetryPolicy, EVENT_ANALYSIS_ERROR, EVENT_ANALYSIS_RESULT, MESSAGE_ID_KEY,
};

// =============================================================================
// Helpers
// =============================================================================

struct CountingAnalyzer {
    calls: Arc<AtomicU32>,
    fail: bool,
}

#[async_trait]
impl Analyzer for CountingAnalyzer {
    fn name(&self) -> &str {
        "counting"
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn analyze(&self, text: &str) -> Result<Value, AnalyzerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AnalyzerError::Unavailable("engine offline".to_string()));
        }
        Ok(json!({
            "clarity_score": 4,
            "testability": "Clear success metric",
            "suggestions": [format!("Measure: {text}")],
        }))
    }
}

struct TestRelay {
    relay: Relay,
    transport: ChannelTransport,
    calls: Arc<AtomicU32>,
}

fn test_relay(fail: bool, config: RelayConfig) -> TestRelay {
    let calls = Arc::new(AtomicU32::new(0));
    let factory: Arc<dyn AnalyzerFactory> = {
        let calls = Arc::clone(&calls);
        Arc::new(move || -> Arc<dyn Analyzer> {
            Arc::new(CountingAnalyzer {
                calls: Arc::clone(&calls),
                fail,
            })
        })
    };
    let transport = ChannelTransport::default();
    let relay = Relay::new(config, factory, Arc::new(transport.clone()));
    TestRelay {
        relay,
        transport,
        calls,
    }
}

fn fast_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.retry = RetryPolicy::immediate();
    config.processor.poll_interval_ms = 20;
    config.queue.poll_interval_ms = 20;
    config
}

async fn next_event(rx: &mut mpsc::Receiver<OutboundEvent>) -> OutboundEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no event within 5s")
        .expect("transport room closed")
}

// =============================================================================
// Delivery
// =============================================================================

#[tokio::test]
async fn test_submit_analyze_deliver_acknowledge() {
    let t = test_relay(false, fast_config());
    let cid = ConnectionId::from("socket-1");
    let mut rx = t.transport.register(&cid);
    let sid = t
        .relay
        .connect(cid, ConnectionMetadata::default().with_ip("10.0.0.7"), None)
        .unwrap();
    t.relay.start();

    let request = AnalysisRequest::new("Increase newsletter signups by 10%")
        .with_session(sid)
        .with_request_id("req-42")
        .with_context("page", "landing");
    let task_id = t.relay.submit(request, Priority::Normal).unwrap();

    let event = next_event(&mut rx).await;
    assert_eq!(event.event, EVENT_ANALYSIS_RESULT);
    assert_eq!(event.payload["task_id"], task_id.as_str());
    assert_eq!(event.payload["request_id"], "req-42");
    assert_eq!(event.payload["context"]["page"], "landing");
    assert_eq!(event.payload["analysis"]["clarity_score"], 4);
    assert!(event.payload["cache_hit"].is_null());

    let message_id = MessageId::from(event.payload[MESSAGE_ID_KEY].as_str().unwrap());
    assert!(t.relay.queue().confirm_delivery(&message_id));
    assert!(!t.relay.queue().confirm_delivery(&message_id));

    let stats = t.relay.stats();
    assert_eq!(stats.processor.processed, 1);
    assert_eq!(stats.queue.sent, 1);
    assert_eq!(stats.queue.confirmed, 1);
    assert_eq!(stats.cache.size, 1);

    t.relay.stop().await;
}

#[tokio::test]
async fn test_result_follows_session_across_reconnect() {
    let t = test_relay(false, fast_config());

    // Submit on the first connection, then lose it before any work runs
    let first = ConnectionId::from("socket-1");
    let mut first_rx = t.transport.register(&first);
    let sid = t
        .relay
        .connect(first.clone(), ConnectionMetadata::default(), None)
        .unwrap();
    t.relay
        .submit(
            AnalysisRequest::new("Reduce checkout abandonment").with_session(sid.clone()),
            Priority::Normal,
        )
        .unwrap();
    t.relay.disconnect(&first);
    t.transport.unregister(&first);

    // Resume the session on a new connection
    let second = ConnectionId::from("socket-2");
    let mut second_rx = t.transport.register(&second);
    let resumed = t
        .relay
        .connect(second, ConnectionMetadata::default(), Some(sid.clone()))
        .unwrap();
    assert_eq!(resumed, sid);

    t.relay.start();
    let event = next_event(&mut second_rx).await;
    assert_eq!(event.event, EVENT_ANALYSIS_RESULT);
    assert!(first_rx.try_recv().is_err());

    t.relay.stop().await;
}

#[tokio::test]
async fn test_repeated_and_similar_submissions_hit_cache() {
    let t = test_relay(false, fast_config());
    let cid = ConnectionId::from("socket-1");
    let mut rx = t.transport.register(&cid);
    let sid = t
        .relay
        .connect(cid, ConnectionMetadata::default(), None)
        .unwrap();
    t.relay.start();

    let submit = |text: &str| {
        t.relay
            .submit(
                AnalysisRequest::new(text).with_session(sid.clone()),
                Priority::Normal,
            )
            .unwrap();
    };

    submit("improve onboarding email open rate");
    let fresh = next_event(&mut rx).await;
    assert!(fresh.payload["cache_hit"].is_null());

    submit("  Improve Onboarding Email Open Rate ");
    let exact = next_event(&mut rx).await;
    assert_eq!(exact.payload["cache_hit"], "exact");
    assert_eq!(exact.payload["analysis"], fresh.payload["analysis"]);

    submit("improve onboarding email open rate today");
    let similar = next_event(&mut rx).await;
    assert_eq!(similar.payload["cache_hit"], "similar");
    assert!(similar.payload["similarity"].as_f64().unwrap() >= 0.75);

    assert_eq!(t.calls.load(Ordering::SeqCst), 1);
    assert_eq!(t.relay.stats().processor.cache_hits, 2);

    t.relay.stop().await;
}

#[tokio::test]
async fn test_permanent_failure_delivers_error_event() {
    let t = test_relay(true, fast_config());
    let cid = ConnectionId::from("socket-1");
    let mut rx = t.transport.register(&cid);
    let sid = t
        .relay
        .connect(cid, ConnectionMetadata::default(), None)
        .unwrap();
    t.relay.start();

    let task_id = t
        .relay
        .submit(
            AnalysisRequest::new("Launch referral programme").with_session(sid),
            Priority::Normal,
        )
        .unwrap();

    let event = next_event(&mut rx).await;
    assert_eq!(event.event, EVENT_ANALYSIS_ERROR);
    assert_eq!(event.payload["task_id"], task_id.as_str());
    assert_eq!(event.payload["attempts"], 3);
    assert_eq!(event.payload["fallback_analysis"]["clarity_score"], 3);
    assert_eq!(t.calls.load(Ordering::SeqCst), 3);
    assert_eq!(t.relay.stats().processor.failed, 1);

    t.relay.stop().await;
}

#[tokio::test]
async fn test_sessionless_request_is_processed_not_delivered() {
    let t = test_relay(false, fast_config());
    t.relay.start();

    t.relay
        .submit(AnalysisRequest::new("Audit pricing page copy"), Priority::Normal)
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while t.relay.stats().processor.processed == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(t.relay.stats().queue.queued, 0);
    assert_eq!(t.relay.cache().len(), 1);

    t.relay.stop().await;
}

#[tokio::test]
async fn test_invalid_submission_is_rejected() {
    let t = test_relay(false, fast_config());
    assert!(t
        .relay
        .submit(AnalysisRequest::new("   "), Priority::Normal)
        .is_err());
    assert!(t
        .relay
        .submit(AnalysisRequest::new("x".repeat(1001)), Priority::Normal)
        .is_err());
    assert_eq!(t.relay.stats().processor.queued, 0);
}

// =============================================================================
// Connections and bindings
// =============================================================================

#[tokio::test]
async fn test_pool_full_rejects_without_binding() {
    let mut config = fast_config();
    config.registry.max_connections = 2;
    let t = test_relay(false, config);

    for id in ["a", "b"] {
        t.relay
            .connect(ConnectionId::from(id), ConnectionMetadata::default(), None)
            .unwrap();
    }
    let err = t
        .relay
        .connect(ConnectionId::from("c"), ConnectionMetadata::default(), None)
        .unwrap_err();

    assert_eq!(err, ConnectError::PoolFull { max_connections: 2 });
    assert_eq!(t.relay.router().resolve_session(&ConnectionId::from("c")), None);
    let stats = t.relay.stats();
    assert_eq!(stats.connections.count, 2);
    assert_eq!(stats.connections.rejected, 1);
    assert_eq!(stats.sessions.bound_sessions, 2);
}

#[tokio::test]
async fn test_health_sweep_purge_unbinds_session() {
    let t = test_relay(false, fast_config());
    let cid = ConnectionId::from("socket-1");
    let sid = t
        .relay
        .connect(cid.clone(), ConnectionMetadata::default(), None)
        .unwrap();

    t.relay.registry().mark_dead(&cid);
    let report = t.relay.registry().sweep();

    assert_eq!(report.purged, vec![cid.clone()]);
    assert_eq!(t.relay.router().resolve_connection(&sid), None);
    assert_eq!(t.relay.router().resolve_session(&cid), None);
    assert!(t.relay.router().get(&sid).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_silent_connection_is_swept_and_unbound() {
    let mut config = fast_config();
    config.registry.heartbeat_interval_secs = 10;
    config.registry.stale_timeout_secs = 30;
    config.registry.resource_sample_every = 0;
    let t = test_relay(false, config);
    let cid = ConnectionId::from("socket-1");
    let sid = t
        .relay
        .connect(cid.clone(), ConnectionMetadata::default(), None)
        .unwrap();
    t.relay.start();

    t.relay.registry().update_ping(&cid);
    tokio::time::sleep(Duration::from_secs(45)).await;

    assert!(!t.relay.registry().contains(&cid));
    assert_eq!(t.relay.router().resolve_connection(&sid), None);

    t.relay.stop().await;
}
