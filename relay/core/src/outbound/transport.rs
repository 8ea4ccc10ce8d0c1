//! Outbound Transport
//!
//! The push primitive the message queue delivers through: one connection,
//! one logical address, push or fail.
//!
//! [`ChannelTransport`] is the in-process implementation. Each live
//! connection registers a room and gets back the receiving half of a bounded
//! channel; whatever owns the real socket drains that receiver.
//!
//! # Usage
//!
//! ```ignore
//! let transport = ChannelTransport::new(64);
//! let mut rx = transport.register(&connection_id);
//!
//! // Forward to the socket
//! tokio::spawn(async move {
//!     while let Some(event) = rx.recv().await {
//!         socket.send(event.event, event.payload).await;
//!     }
//! });
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::registry::ConnectionId;

/// Errors reported by a transport push
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No room registered for the connection
    #[error("no transport room for connection {0}")]
    NoSuchConnection(ConnectionId),

    /// The connection's receiver has gone away
    #[error("transport channel closed for connection {0}")]
    Closed(ConnectionId),

    /// The connection is not draining its channel fast enough
    #[error("transport channel full for connection {0}")]
    Backpressure(ConnectionId),
}

/// Push primitive consumed by the outbound message queue
#[async_trait]
pub trait Transport: Send + Sync {
    /// Push one event to one connection
    async fn push(
        &self,
        connection_id: &ConnectionId,
        event: &str,
        payload: &Value,
    ) -> Result<(), TransportError>;
}

/// An event as delivered to a connection
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutboundEvent {
    /// Event name (e.g. `analysis_result`)
    pub event: String,
    /// Event payload
    pub payload: Value,
}

/// Room-addressed in-process transport
///
/// Cheap to clone; all clones share the same rooms.
#[derive(Clone)]
pub struct ChannelTransport {
    rooms: Arc<DashMap<ConnectionId, mpsc::Sender<OutboundEvent>>>,
    capacity: usize,
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new(100)
    }
}

impl ChannelTransport {
    /// Create a transport whose rooms buffer `capacity` events each
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Open a room for a connection, replacing any previous one
    pub fn register(&self, connection_id: &ConnectionId) -> mpsc::Receiver<OutboundEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.rooms.insert(connection_id.clone(), tx).is_some() {
            tracing::debug!(connection_id = %connection_id, "Transport room replaced");
        }
        rx
    }

    /// Close a connection's room
    pub fn unregister(&self, connection_id: &ConnectionId) -> bool {
        self.rooms.remove(connection_id).is_some()
    }

    /// Number of open rooms
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn push(
        &self,
        connection_id: &ConnectionId,
        event: &str,
        payload: &Value,
    ) -> Result<(), TransportError> {
        let tx = self
            .rooms
            .get(connection_id)
            .map(|room| room.value().clone())
            .ok_or_else(|| TransportError::NoSuchConnection(connection_id.clone()))?;

        let outbound = OutboundEvent {
            event: event.to_string(),
            payload: payload.clone(),
        };
        match tx.try_send(outbound) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(TransportError::Backpressure(connection_id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.rooms.remove(connection_id);
                Err(TransportError::Closed(connection_id.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_push_reaches_registered_room() {
        let transport = ChannelTransport::default();
        let id = ConnectionId::from("c1");
        let mut rx = transport.register(&id);

        tokio_test::assert_ok!(
            transport
                .push(&id, "analysis_result", &json!({ "ok": true }))
                .await
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "analysis_result");
        assert_eq!(event.payload, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_push_to_unknown_connection_fails() {
        let transport = ChannelTransport::default();
        let err = transport
            .push(&ConnectionId::from("ghost"), "e", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NoSuchConnection(ConnectionId::from("ghost")));
    }

    #[tokio::test]
    async fn test_dropped_receiver_closes_room() {
        let transport = ChannelTransport::default();
        let id = ConnectionId::from("c1");
        drop(transport.register(&id));

        let err = transport.push(&id, "e", &json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed(_)));
        assert_eq!(transport.room_count(), 0);
    }

    #[tokio::test]
    async fn test_full_room_reports_backpressure() {
        let transport = ChannelTransport::new(1);
        let id = ConnectionId::from("c1");
        let _rx = transport.register(&id);

        tokio_test::assert_ok!(transport.push(&id, "e", &json!(1)).await);
        let err = tokio_test::assert_err!(transport.push(&id, "e", &json!(2)).await);
        assert!(matches!(err, TransportError::Backpressure(_)));
    }
}
