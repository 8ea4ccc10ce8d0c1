//! Session Router
//!
//! Maps logical client sessions to whichever live connection currently
//! represents them, so that work submitted under one connection can be
//! delivered after the client reconnects under another.
//!
//! # Design Philosophy
//!
//! A session outlives any single connection. The router keeps a forward map
//! (session to connection) and a reverse map (connection to session) under
//! one lock, so the two can never disagree:
//!
//! ```text
//!   resolve_connection(S) == Some(C)  ⇒  resolve_session(C) == Some(S)
//! ```
//!
//! Sessions expire on a sliding window. Any touch (bind, resolve, request
//! attribution) resets `last_activity`; a session idle for longer than the
//! timeout is treated as expired the next time it is read. There is no
//! eager sweep.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::registry::ConnectionId;

/// Unique session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new unique session ID
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A logical client session
#[derive(Clone, Debug)]
pub struct Session {
    /// Session identifier
    pub id: SessionId,
    /// Wall-clock creation time
    pub created_at: DateTime<Utc>,
    /// Last time the session was touched
    pub last_activity: Instant,
    /// Connection currently representing the session
    pub connection: Option<ConnectionId>,
    /// Cleared once the session is found expired
    pub active: bool,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            connection: None,
            active: true,
        }
    }

    /// Whether the session has been idle for longer than `timeout`
    #[must_use]
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        !self.active || now.saturating_duration_since(self.last_activity) > timeout
    }

    /// Time since the last touch
    #[must_use]
    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Router configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Idle time after which a session expires (seconds)
    pub session_timeout_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 1800,
        }
    }
}

impl RouterConfig {
    /// Session idle timeout
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

/// Router statistics
#[derive(Clone, Debug, Default, Serialize)]
pub struct RouterStats {
    /// Sessions held, including expired ones not yet read
    pub total_sessions: usize,
    /// Sessions currently bound to a connection
    pub bound_sessions: usize,
    /// Sessions created since start
    pub created: u64,
    /// Sessions found expired
    pub expired: u64,
}

#[derive(Default)]
struct RouterState {
    sessions: HashMap<SessionId, Session>,
    by_connection: HashMap<ConnectionId, SessionId>,
}

impl RouterState {
    /// Drop whatever binding `session_id` holds, on both sides
    fn detach_session(&mut self, session_id: &SessionId) -> Option<ConnectionId> {
        let session = self.sessions.get_mut(session_id)?;
        let connection = session.connection.take()?;
        self.by_connection.remove(&connection);
        Some(connection)
    }

    /// Drop whatever binding `connection_id` holds, on both sides
    fn detach_connection(&mut self, connection_id: &ConnectionId) -> Option<SessionId> {
        let session_id = self.by_connection.remove(connection_id)?;
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.connection = None;
        }
        Some(session_id)
    }

    /// Flip an expired session inactive and release its binding
    fn expire(&mut self, session_id: &SessionId) {
        self.detach_session(session_id);
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.active = false;
        }
    }
}

struct RouterInner {
    config: RouterConfig,
    state: RwLock<RouterState>,
    created: AtomicU64,
    expired: AtomicU64,
}

/// Session to connection directory
///
/// Cheap to clone; all clones share the same directory.
#[derive(Clone)]
pub struct SessionRouter {
    inner: Arc<RouterInner>,
}

impl Default for SessionRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl SessionRouter {
    /// Create an empty router
    #[must_use]
    pub fn new(config: RouterConfig) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                config,
                state: RwLock::new(RouterState::default()),
                created: AtomicU64::new(0),
                expired: AtomicU64::new(0),
            }),
        }
    }

    /// Router configuration
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    fn timeout(&self) -> Duration {
        self.inner.config.session_timeout()
    }

    /// Create a new, unbound session
    pub fn create(&self) -> SessionId {
        let id = SessionId::new();
        self.inner
            .state
            .write()
            .sessions
            .insert(id.clone(), Session::new(id.clone()));
        self.inner.created.fetch_add(1, Ordering::Relaxed);
        tracing::info!(session_id = %id, "Session created");
        id
    }

    /// Get a session
    ///
    /// Returns `None` for unknown sessions and for sessions that have expired;
    /// an expired session is flipped inactive and loses its binding.
    pub fn get(&self, session_id: &SessionId) -> Option<Session> {
        let now = Instant::now();
        let mut state = self.inner.state.write();
        let session = state.sessions.get(session_id)?;
        if session.is_expired(now, self.timeout()) {
            let newly_expired = session.active;
            state.expire(session_id);
            drop(state);
            if newly_expired {
                self.inner.expired.fetch_add(1, Ordering::Relaxed);
                tracing::info!(session_id = %session_id, "Session expired");
            }
            return None;
        }
        Some(session.clone())
    }

    /// Look up a live session and refresh its activity, under the caller's lock
    fn touch_locked(
        &self,
        state: &mut RouterState,
        session_id: &SessionId,
        now: Instant,
    ) -> Option<()> {
        let session = state.sessions.get(session_id)?;
        if session.is_expired(now, self.timeout()) {
            if session.active {
                self.inner.expired.fetch_add(1, Ordering::Relaxed);
                tracing::info!(session_id = %session_id, "Session expired");
            }
            state.expire(session_id);
            return None;
        }
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.last_activity = now;
        }
        Some(())
    }

    /// Bind a connection to a session
    ///
    /// Returns `false` if the session does not exist or has expired. A
    /// previous connection of the session is silently superseded, and a
    /// connection already bound to another session is detached from it.
    pub fn bind(&self, session_id: &SessionId, connection_id: ConnectionId) -> bool {
        let now = Instant::now();
        let mut state = self.inner.state.write();
        if self.touch_locked(&mut state, session_id, now).is_none() {
            drop(state);
            tracing::warn!(
                session_id = %session_id,
                connection_id = %connection_id,
                "Bind rejected: session unknown or expired"
            );
            return false;
        }

        let previous_session = state.detach_connection(&connection_id);
        let previous_connection = state.detach_session(session_id);

        state
            .by_connection
            .insert(connection_id.clone(), session_id.clone());
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.connection = Some(connection_id.clone());
        }
        drop(state);

        if let Some(old) = previous_connection.filter(|old| old != &connection_id) {
            tracing::info!(
                session_id = %session_id,
                connection_id = %connection_id,
                superseded = %old,
                "Session rebound"
            );
        } else {
            tracing::info!(session_id = %session_id, connection_id = %connection_id, "Session bound");
        }
        if let Some(other) = previous_session.filter(|other| other != session_id) {
            tracing::debug!(
                connection_id = %connection_id,
                previous_session = %other,
                "Connection moved between sessions"
            );
        }
        true
    }

    /// Remove a connection's binding, returning the session it represented
    pub fn unbind(&self, connection_id: &ConnectionId) -> Option<SessionId> {
        let session_id = self.inner.state.write().detach_connection(connection_id);
        if let Some(session_id) = &session_id {
            tracing::info!(session_id = %session_id, connection_id = %connection_id, "Session unbound");
        }
        session_id
    }

    /// Connection currently representing a session; touches the session
    pub fn resolve_connection(&self, session_id: &SessionId) -> Option<ConnectionId> {
        let now = Instant::now();
        let mut state = self.inner.state.write();
        self.touch_locked(&mut state, session_id, now)?;
        state
            .sessions
            .get(session_id)
            .and_then(|session| session.connection.clone())
    }

    /// Session a connection currently represents
    #[must_use]
    pub fn resolve_session(&self, connection_id: &ConnectionId) -> Option<SessionId> {
        self.inner.state.read().by_connection.get(connection_id).cloned()
    }

    /// Attribute activity to a session (e.g. a submitted request)
    ///
    /// Returns `false` if the session does not exist or has expired.
    pub fn touch(&self, session_id: &SessionId) -> bool {
        let now = Instant::now();
        let mut state = self.inner.state.write();
        self.touch_locked(&mut state, session_id, now).is_some()
    }

    /// Drop every expired session
    ///
    /// A session that is still bound is unbound first, so its connection no
    /// longer resolves. Never called automatically; embedders with long
    /// uptimes may call it periodically to bound the session map.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let timeout = self.timeout();
        let mut state = self.inner.state.write();
        let expired: Vec<SessionId> = state
            .sessions
            .values()
            .filter(|s| s.is_expired(now, timeout))
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            if state.sessions.get(id).is_some_and(|s| s.active) {
                self.inner.expired.fetch_add(1, Ordering::Relaxed);
            }
            state.detach_session(id);
            state.sessions.remove(id);
        }
        drop(state);

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Pruned expired sessions");
        }
        expired.len()
    }

    /// Router statistics
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        let state = self.inner.state.read();
        RouterStats {
            total_sessions: state.sessions.len(),
            bound_sessions: state.by_connection.len(),
            created: self.inner.created.load(Ordering::Relaxed),
            expired: self.inner.expired.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for SessionRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("SessionRouter")
            .field("sessions", &state.sessions.len())
            .field("bound", &state.by_connection.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    fn assert_symmetric(router: &SessionRouter, sessions: &[SessionId], connections: &[ConnectionId]) {
        for s in sessions {
            if let Some(c) = router.resolve_connection(s) {
                assert_eq!(router.resolve_session(&c).as_ref(), Some(s));
            }
        }
        for c in connections {
            if let Some(s) = router.resolve_session(c) {
                assert_eq!(router.resolve_connection(&s).as_ref(), Some(c));
            }
        }
    }

    #[test]
    fn test_create_and_get() {
        let router = SessionRouter::default();
        let id = router.create();
        let session = router.get(&id).unwrap();
        assert!(session.active);
        assert!(session.connection.is_none());
        assert!(router.get(&SessionId::from("missing")).is_none());
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_bind_and_resolve() {
        let router = SessionRouter::default();
        let id = router.create();

        assert!(router.bind(&id, conn("c1")));
        assert_eq!(router.resolve_connection(&id), Some(conn("c1")));
        assert_eq!(router.resolve_session(&conn("c1")), Some(id));
    }

    #[test]
    fn test_bind_unknown_session_fails() {
        let router = SessionRouter::default();
        assert!(!router.bind(&SessionId::from("missing"), conn("c1")));
        assert!(router.resolve_session(&conn("c1")).is_none());
    }

    #[test]
    fn test_rebind_supersedes_old_connection() {
        let router = SessionRouter::default();
        let id = router.create();
        router.bind(&id, conn("c1"));
        router.bind(&id, conn("c2"));

        assert_eq!(router.resolve_connection(&id), Some(conn("c2")));
        assert_eq!(router.resolve_session(&conn("c2")), Some(id));
        assert!(router.resolve_session(&conn("c1")).is_none());
        assert_eq!(router.stats().bound_sessions, 1);
    }

    #[test]
    fn test_connection_moves_between_sessions() {
        let router = SessionRouter::default();
        let s1 = router.create();
        let s2 = router.create();
        router.bind(&s1, conn("c1"));
        router.bind(&s2, conn("c1"));

        assert!(router.resolve_connection(&s1).is_none());
        assert_eq!(router.resolve_connection(&s2), Some(conn("c1")));
        assert_eq!(router.resolve_session(&conn("c1")), Some(s2));
    }

    #[test]
    fn test_unbind() {
        let router = SessionRouter::default();
        let id = router.create();
        router.bind(&id, conn("c1"));

        assert_eq!(router.unbind(&conn("c1")), Some(id.clone()));
        assert!(router.unbind(&conn("c1")).is_none());
        assert!(router.resolve_connection(&id).is_none());
        // Session itself survives
        assert!(router.get(&id).is_some());
    }

    #[test]
    fn test_binding_is_always_symmetric() {
        let router = SessionRouter::default();
        let sessions: Vec<SessionId> = (0..4).map(|_| router.create()).collect();
        let connections: Vec<ConnectionId> = (0..5).map(|i| conn(&format!("c{i}"))).collect();

        let steps = [(0, 0), (1, 1), (0, 2), (2, 2), (3, 0), (1, 4), (1, 3), (2, 1)];
        for (s, c) in steps {
            router.bind(&sessions[s], connections[c].clone());
            assert_symmetric(&router, &sessions, &connections);
        }
        router.unbind(&connections[1]);
        assert_symmetric(&router, &sessions, &connections);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbound_session_expires() {
        let router = SessionRouter::new(RouterConfig {
            session_timeout_secs: 60,
        });
        let id = router.create();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(router.get(&id).is_none());
        assert!(!router.bind(&id, conn("c1")));
        assert_eq!(router.stats().expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_slides_expiry_window() {
        let router = SessionRouter::new(RouterConfig {
            session_timeout_secs: 60,
        });
        let id = router.create();
        router.bind(&id, conn("c1"));

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(router.touch(&id));
        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(router.resolve_connection(&id), Some(conn("c1")));
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(router.get(&id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_releases_binding() {
        let router = SessionRouter::new(RouterConfig {
            session_timeout_secs: 10,
        });
        let id = router.create();
        router.bind(&id, conn("c1"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(router.resolve_connection(&id).is_none());
        assert!(router.resolve_session(&conn("c1")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_expired() {
        let router = SessionRouter::new(RouterConfig {
            session_timeout_secs: 10,
        });
        let old = router.create();
        tokio::time::advance(Duration::from_secs(8)).await;
        let young = router.create();
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(router.prune_expired(), 1);
        assert!(router.get(&old).is_none());
        assert!(router.get(&young).is_some());
        assert_eq!(router.stats().total_sessions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_expired_unbinds_bound_session() {
        let router = SessionRouter::new(RouterConfig {
            session_timeout_secs: 10,
        });
        let session = router.create();
        let connection = ConnectionId::from("socket-1");
        assert!(router.bind(&session, connection.clone()));
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(router.prune_expired(), 1);
        assert!(router.get(&session).is_none());
        assert_eq!(router.resolve_session(&connection), None);
        assert_eq!(router.stats().bound_sessions, 0);
    }
}
