//! Outbound Message Queue
//!
//! Delivers events to whichever connection currently represents a session.
//!
//! # Design
//!
//! ```text
//!   enqueue ──► priority queue (HIGH before NORMAL, FIFO within a level)
//!                     │
//!                     ▼
//!              delivery worker ──► router.resolve_connection(session)
//!                     │                 │
//!                     │         none / push failed
//!                     │                 ▼
//!                     │           retry tier (backoff) ──► failed after 3 attempts
//!                     ▼
//!              transport.push ──► sent map ──► confirm_delivery / expiry
//! ```
//!
//! Capacity is shared by the priority queue and the retry tier; a full queue
//! is reported to the producer as [`QueueError::Full`] and nothing is
//! enqueued. Messages that were pushed but never acknowledged are dropped from
//! the sent map after `confirmation_timeout`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::lifecycle::join_with_timeout;
use crate::retry::RetryPolicy;
use crate::scheduling::{Priority, PriorityQueue};
use crate::session::{SessionId, SessionRouter};

mod transport;

pub use transport::{ChannelTransport, OutboundEvent, Transport, TransportError};

/// Payload key carrying the message id, used by clients to acknowledge
pub const MESSAGE_ID_KEY: &str = "_message_id";

/// Message identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a new unique message ID
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors from the message queue
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Pending plus retrying messages reached capacity
    #[error("message queue full ({max_size} pending)")]
    Full {
        /// Configured capacity
        max_size: usize,
    },
}

/// A message awaiting delivery
#[derive(Clone, Debug, Serialize)]
pub struct QueuedMessage {
    /// Message identifier
    pub id: MessageId,
    /// Target session
    pub session_id: SessionId,
    /// Event name
    pub event: String,
    /// Payload, with the message id embedded under [`MESSAGE_ID_KEY`]
    pub payload: Value,
    /// Delivery priority
    pub priority: Priority,
    /// When the message was enqueued
    pub created_at: DateTime<Utc>,
    /// Failed delivery attempts so far
    pub attempts: u32,
}

/// Message queue configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum pending messages (priority queue plus retry tier)
    pub max_size: usize,
    /// Longest the worker sleeps when idle (milliseconds)
    pub poll_interval_ms: u64,
    /// How long a sent message waits for acknowledgement (seconds)
    pub confirmation_timeout_secs: u64,
    /// How long `stop()` waits for the worker (milliseconds)
    pub shutdown_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 500,
            poll_interval_ms: 100,
            confirmation_timeout_secs: 300,
            shutdown_timeout_ms: 2_000,
        }
    }
}

impl QueueConfig {
    /// Idle poll interval
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Acknowledgement timeout
    #[must_use]
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

/// Message queue statistics
#[derive(Clone, Debug, Default, Serialize)]
pub struct QueueStats {
    /// Messages waiting in the priority queue
    pub queue_size: usize,
    /// Messages waiting in the retry tier
    pub retry_queue_size: usize,
    /// Sent messages awaiting acknowledgement
    pub sent_pending: usize,
    /// Messages accepted since start
    pub queued: u64,
    /// Messages pushed to a connection
    pub sent: u64,
    /// Messages dropped after exhausting retries
    pub failed: u64,
    /// Retries scheduled
    pub retried: u64,
    /// Deliveries acknowledged
    pub confirmed: u64,
    /// Sent messages dropped without acknowledgement
    pub unconfirmed_expired: u64,
    /// Enqueue calls refused for capacity
    pub rejected: u64,
    /// Whether the delivery worker is running
    pub running: bool,
}

struct Retry {
    ready_at: Instant,
    message: QueuedMessage,
}

struct Sent {
    session_id: SessionId,
    sent_at: Instant,
}

#[derive(Default)]
struct Counters {
    queued: u64,
    sent: u64,
    failed: u64,
    retried: u64,
    confirmed: u64,
    unconfirmed_expired: u64,
    rejected: u64,
}

struct QueueState {
    pending: PriorityQueue<QueuedMessage>,
    retries: VecDeque<Retry>,
    sent: HashMap<MessageId, Sent>,
    counters: Counters,
}

impl QueueState {
    fn len(&self) -> usize {
        self.pending.len() + self.retries.len()
    }

    /// First retry whose backoff has elapsed
    fn pop_ready_retry(&mut self, now: Instant) -> Option<QueuedMessage> {
        let position = self.retries.iter().position(|r| r.ready_at <= now)?;
        self.retries.remove(position).map(|r| r.message)
    }

    fn next_retry_at(&self) -> Option<Instant> {
        self.retries.iter().map(|r| r.ready_at).min()
    }

    fn expire_unconfirmed(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.sent.len();
        self.sent
            .retain(|_, sent| now.saturating_duration_since(sent.sent_at) <= timeout);
        let expired = before - self.sent.len();
        self.counters.unconfirmed_expired += expired as u64;
        expired
    }
}

struct QueueInner {
    config: QueueConfig,
    retry: RetryPolicy,
    router: SessionRouter,
    transport: Arc<dyn Transport>,
    state: Mutex<QueueState>,
    running: AtomicBool,
    wakeup: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Session-addressed outbound message queue
///
/// Cheap to clone; all clones share the same queue and worker.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

impl MessageQueue {
    /// Create a queue delivering through `transport`
    pub fn new(
        config: QueueConfig,
        retry: RetryPolicy,
        router: SessionRouter,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                retry,
                router,
                transport,
                state: Mutex::new(QueueState {
                    pending: PriorityQueue::new(),
                    retries: VecDeque::new(),
                    sent: HashMap::new(),
                    counters: Counters::default(),
                }),
                running: AtomicBool::new(false),
                wakeup: Notify::new(),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Queue configuration
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Queue an event for a session
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] when `max_size` messages are already
    /// pending or retrying; nothing is enqueued in that case.
    pub fn enqueue(
        &self,
        session_id: &SessionId,
        event: &str,
        payload: Value,
        priority: Priority,
    ) -> Result<MessageId, QueueError> {
        let id = MessageId::generate();
        let message = QueuedMessage {
            id: id.clone(),
            session_id: session_id.clone(),
            event: event.to_string(),
            payload: embed_message_id(payload, &id),
            priority,
            created_at: Utc::now(),
            attempts: 0,
        };

        let max_size = self.inner.config.max_size;
        {
            let mut state = self.inner.state.lock();
            if state.len() >= max_size {
                state.counters.rejected += 1;
                drop(state);
                tracing::warn!(session_id = %session_id, event, max_size, "Message queue full");
                return Err(QueueError::Full { max_size });
            }
            state.pending.push(message, priority);
            state.counters.queued += 1;
        }

        self.inner.wakeup.notify_one();
        tracing::debug!(message_id = %id, session_id = %session_id, event, %priority, "Message queued");
        Ok(id)
    }

    /// Acknowledge a delivered message
    ///
    /// Returns `false` for unknown, already confirmed or expired messages.
    pub fn confirm_delivery(&self, message_id: &MessageId) -> bool {
        let mut state = self.inner.state.lock();
        match state.sent.remove(message_id) {
            Some(sent) => {
                state.counters.confirmed += 1;
                drop(state);
                tracing::debug!(message_id = %message_id, session_id = %sent.session_id, "Delivery confirmed");
                true
            }
            None => false,
        }
    }

    /// Drop sent messages whose acknowledgement window has passed
    ///
    /// The worker runs this on its own; it is public for embedders that
    /// drive delivery manually.
    pub fn expire_unconfirmed(&self) -> usize {
        let timeout = self.inner.config.confirmation_timeout();
        let expired = self
            .inner
            .state
            .lock()
            .expire_unconfirmed(Instant::now(), timeout);
        if expired > 0 {
            tracing::debug!(expired, "Dropped unconfirmed messages");
        }
        expired
    }

    /// Queue statistics
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        let c = &state.counters;
        QueueStats {
            queue_size: state.pending.len(),
            retry_queue_size: state.retries.len(),
            sent_pending: state.sent.len(),
            queued: c.queued,
            sent: c.sent,
            failed: c.failed,
            retried: c.retried,
            confirmed: c.confirmed,
            unconfirmed_expired: c.unconfirmed_expired,
            rejected: c.rejected,
            running: self.inner.running.load(Ordering::SeqCst),
        }
    }

    /// Pending plus retrying messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().len()
    }

    /// Whether nothing is pending or retrying
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the delivery worker
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let queue = self.clone();
        let handle = tokio::spawn(async move { queue.run().await });
        *self.inner.worker.lock() = Some(handle);
        tracing::info!("Message queue started");
    }

    /// Stop the delivery worker
    ///
    /// The worker finishes the message in hand; undelivered messages stay
    /// queued.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.wakeup.notify_one();
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            join_with_timeout(
                "message_queue",
                vec![handle],
                Duration::from_millis(self.inner.config.shutdown_timeout_ms),
            )
            .await;
        }
        tracing::info!("Message queue stopped");
    }

    /// Whether the delivery worker is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    async fn run(&self) {
        let poll = self.inner.config.poll_interval();

        while self.inner.running.load(Ordering::SeqCst) {
            let mut worked = false;

            let next = self.inner.state.lock().pending.pop();
            if let Some(message) = next {
                self.deliver(message).await;
                worked = true;
            }

            let retry = self.inner.state.lock().pop_ready_retry(Instant::now());
            if let Some(message) = retry {
                self.deliver(message).await;
                worked = true;
            }

            self.expire_unconfirmed();

            if !worked {
                let now = Instant::now();
                let deadline = self
                    .inner
                    .state
                    .lock()
                    .next_retry_at()
                    .map_or(now + poll, |at| at.min(now + poll));
                tokio::select! {
                    () = self.inner.wakeup.notified() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
        }
    }

    async fn deliver(&self, message: QueuedMessage) {
        let Some(connection_id) = self.inner.router.resolve_connection(&message.session_id) else {
            tracing::debug!(
                message_id = %message.id,
                session_id = %message.session_id,
                "No connection bound for session"
            );
            self.schedule_retry(message, "no connection bound");
            return;
        };

        match self
            .inner
            .transport
            .push(&connection_id, &message.event, &message.payload)
            .await
        {
            Ok(()) => {
                let mut state = self.inner.state.lock();
                state.sent.insert(
                    message.id.clone(),
                    Sent {
                        session_id: message.session_id.clone(),
                        sent_at: Instant::now(),
                    },
                );
                state.counters.sent += 1;
                drop(state);
                tracing::info!(
                    message_id = %message.id,
                    session_id = %message.session_id,
                    connection_id = %connection_id,
                    event = %message.event,
                    "Message sent"
                );
            }
            Err(e) => {
                let reason = e.to_string();
                self.schedule_retry(message, &reason);
            }
        }
    }

    fn schedule_retry(&self, mut message: QueuedMessage, reason: &str) {
        message.attempts += 1;
        let mut state = self.inner.state.lock();

        if self.inner.retry.should_retry(message.attempts) {
            let delay = self.inner.retry.backoff(message.attempts);
            let (id, attempts) = (message.id.clone(), message.attempts);
            state.retries.push_back(Retry {
                ready_at: Instant::now() + delay,
                message,
            });
            state.counters.retried += 1;
            drop(state);
            tracing::warn!(
                message_id = %id,
                attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                reason,
                "Delivery failed, will retry"
            );
        } else {
            state.counters.failed += 1;
            drop(state);
            tracing::error!(
                message_id = %message.id,
                session_id = %message.session_id,
                attempts = message.attempts,
                reason,
                "Delivery failed permanently, dropping message"
            );
        }
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MessageQueue")
            .field("pending", &state.pending.len())
            .field("retrying", &state.retries.len())
            .field("running", &self.inner.running.load(Ordering::SeqCst))
            .finish()
    }
}

/// Put the message id into the payload; non-object payloads are wrapped
fn embed_message_id(payload: Value, id: &MessageId) -> Value {
    let mut object = match payload {
        Value::Object(object) => object,
        other => {
            let mut object = Map::new();
            object.insert("data".to_string(), other);
            object
        }
    };
    object.insert(MESSAGE_ID_KEY.to_string(), Value::String(id.to_string()));
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::registry::ConnectionId;

    struct Harness {
        queue: MessageQueue,
        router: SessionRouter,
        transport: ChannelTransport,
    }

    fn harness(config: QueueConfig) -> Harness {
        let router = SessionRouter::default();
        let transport = ChannelTransport::default();
        let retry = RetryPolicy {
            use_jitter: false,
            ..RetryPolicy::default()
        };
        let queue = MessageQueue::new(config, retry, router.clone(), Arc::new(transport.clone()));
        Harness {
            queue,
            router,
            transport,
        }
    }

    fn connect(h: &Harness, session: &SessionId, id: &str) -> mpsc::Receiver<OutboundEvent> {
        let connection = ConnectionId::from(id);
        let rx = h.transport.register(&connection);
        assert!(h.router.bind(session, connection));
        rx
    }

    async fn recv(rx: &mut mpsc::Receiver<OutboundEvent>) -> OutboundEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .ok()
            .flatten()
            .unwrap()
    }

    #[test]
    fn test_full_queue_rejects_and_keeps_size() {
        let h = harness(QueueConfig {
            max_size: 2,
            ..QueueConfig::default()
        });
        let session = SessionId::from("s");
        h.queue.enqueue(&session, "e", json!({}), Priority::Normal).unwrap();
        h.queue.enqueue(&session, "e", json!({}), Priority::Normal).unwrap();

        let err = h
            .queue
            .enqueue(&session, "e", json!({}), Priority::High)
            .unwrap_err();
        assert_eq!(err, QueueError::Full { max_size: 2 });
        assert_eq!(h.queue.len(), 2);
        assert_eq!(h.queue.stats().rejected, 1);
    }

    #[test]
    fn test_message_id_embedded_in_payload() {
        let h = harness(QueueConfig::default());
        let session = SessionId::from("s");
        let id = h
            .queue
            .enqueue(&session, "e", json!({ "k": 1 }), Priority::Normal)
            .unwrap();
        let message = h.queue.inner.state.lock().pending.pop().unwrap();
        assert_eq!(message.payload, json!({ "k": 1, "_message_id": id.as_str() }));

        let wrapped = embed_message_id(json!("text"), &id);
        assert_eq!(wrapped, json!({ "data": "text", "_message_id": id.as_str() }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_delivered_first() {
        let h = harness(QueueConfig::default());
        let session = h.router.create();
        let mut rx = connect(&h, &session, "c1");

        for (name, priority) in [
            ("n1", Priority::Normal),
            ("h1", Priority::High),
            ("n2", Priority::Normal),
            ("h2", Priority::High),
        ] {
            h.queue.enqueue(&session, name, json!({}), priority).unwrap();
        }
        h.queue.start();

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(recv(&mut rx).await.event);
        }
        assert_eq!(order, vec!["h1", "h2", "n1", "n2"]);
        h.queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbound_session_retried_until_reconnect() {
        let h = harness(QueueConfig::default());
        let session = h.router.create();
        h.queue.start();
        h.queue
            .enqueue(&session, "analysis_result", json!({}), Priority::High)
            .unwrap();

        // First attempt finds no connection and backs off
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.queue.stats().retry_queue_size, 1);

        let mut rx = connect(&h, &session, "c2");
        let event = recv(&mut rx).await;
        assert_eq!(event.event, "analysis_result");

        let stats = h.queue.stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.failed, 0);
        h.queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_after_three_attempts() {
        let h = harness(QueueConfig::default());
        let session = h.router.create();
        h.queue.start();
        h.queue.enqueue(&session, "e", json!({}), Priority::Normal).unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let stats = h.queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, 2);
        assert!(h.queue.is_empty());
        h.queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_is_retried() {
        let h = harness(QueueConfig::default());
        let session = h.router.create();
        // Bound in the router, but no transport room yet
        h.router.bind(&session, ConnectionId::from("c1"));
        h.queue.start();
        h.queue.enqueue(&session, "e", json!({}), Priority::Normal).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut rx = h.transport.register(&ConnectionId::from("c1"));
        assert_eq!(recv(&mut rx).await.event, "e");
        h.queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_delivery() {
        let h = harness(QueueConfig::default());
        let session = h.router.create();
        let mut rx = connect(&h, &session, "c1");
        h.queue.start();
        h.queue.enqueue(&session, "e", json!({}), Priority::Normal).unwrap();

        let event = recv(&mut rx).await;
        let id = MessageId::from(event.payload[MESSAGE_ID_KEY].as_str().unwrap());
        assert!(h.queue.confirm_delivery(&id));
        assert!(!h.queue.confirm_delivery(&id));
        assert_eq!(h.queue.stats().confirmed, 1);
        h.queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_messages_expire() {
        let h = harness(QueueConfig {
            confirmation_timeout_secs: 1,
            ..QueueConfig::default()
        });
        let session = h.router.create();
        let mut rx = connect(&h, &session, "c1");
        h.queue.start();
        h.queue.enqueue(&session, "e", json!({}), Priority::Normal).unwrap();
        recv(&mut rx).await;
        assert_eq!(h.queue.stats().sent_pending, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let stats = h.queue.stats();
        assert_eq!(stats.sent_pending, 0);
        assert_eq!(stats.unconfirmed_expired, 1);
        h.queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let h = harness(QueueConfig::default());
        h.queue.start();
        assert!(h.queue.is_running());
        h.queue.stop().await;
        h.queue.stop().await;
        assert!(!h.queue.is_running());
    }
}
