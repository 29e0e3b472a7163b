//! Registry of open connections.
//!
//! The registry is the only shared mutable structure in Herald. Mutation is
//! serialized per shard by [`DashMap`]; readers take a [`Snapshot`], an
//! owned copy of the connection handles that concurrent add/remove calls
//! can never invalidate.

use crate::error::{DeliveryError, RouterError};
use crate::message::{now_millis, Notification};
use crate::routing::{RecipientTag, RoutingTarget};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Outbound queue feeding a single connection's writer task.
pub type Outbound = mpsc::Sender<Arc<Notification>>;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection's session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Create a session ID from an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh session ID.
    #[must_use]
    pub fn generate() -> Self {
        let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("sess_{:x}_{:x}", now_millis(), counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Handshake done, not yet announced.
    Connecting = 0,
    /// Registered and accepting application messages.
    Open = 1,
    /// Closing or closed. Terminal.
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }
}

/// A live duplex connection as seen by the router.
pub struct Connection {
    id: SessionId,
    tag: RecipientTag,
    outbound: Outbound,
    state: AtomicU8,
    connected_at: u64,
}

impl Connection {
    /// Create a connection in the `Connecting` state.
    #[must_use]
    pub fn new(id: SessionId, tag: RecipientTag, outbound: Outbound) -> Self {
        Self {
            id,
            tag,
            outbound,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            connected_at: now_millis(),
        }
    }

    /// Get the session ID.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Get the recipient tag.
    #[must_use]
    pub fn tag(&self) -> &RecipientTag {
        &self.tag
    }

    /// Get the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Connect time in milliseconds since the Unix epoch.
    #[must_use]
    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    /// Move `Connecting` to `Open`. Has no effect once closed.
    pub(crate) fn mark_open(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Connecting as u8,
            ConnectionState::Open as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Move to `Closed`. Returns `false` if the connection was already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        self.state.swap(ConnectionState::Closed as u8, Ordering::SeqCst)
            != ConnectionState::Closed as u8
    }

    /// Enqueue a notification for this connection without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::QueueFull`] if the peer is not keeping up and
    /// [`DeliveryError::Closed`] if the writer side has gone away.
    pub fn send(&self, notification: Arc<Notification>) -> Result<(), DeliveryError> {
        self.outbound.try_send(notification).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("state", &self.state())
            .field("outbound_closed", &self.outbound.is_closed())
            .finish()
    }
}

/// An immutable point-in-time view of the registered connections.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    connections: Vec<Arc<Connection>>,
}

impl Snapshot {
    /// Iterate over the connections in the snapshot.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.connections.iter()
    }

    /// Number of connections in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Whether the snapshot contains the given session.
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.connections.iter().any(|c| c.id() == id)
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Arc<Connection>;
    type IntoIter = std::slice::Iter<'a, Arc<Connection>>;

    fn into_iter(self) -> Self::IntoIter {
        self.connections.iter()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    /// Number of open connections.
    pub connection_count: usize,
    /// Number of distinct recipient tags, ignoring case.
    pub tag_count: usize,
}

/// Thread-safe set of open connections keyed by session ID.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<SessionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an open connection.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateSession`] if the session ID is
    /// already registered. The existing connection is left untouched.
    pub fn add(&self, connection: Connection) -> Result<Arc<Connection>, RouterError> {
        match self.connections.entry(connection.id.clone()) {
            Entry::Occupied(entry) => Err(RouterError::DuplicateSession(entry.key().clone())),
            Entry::Vacant(entry) => {
                let connection = Arc::new(connection);
                entry.insert(Arc::clone(&connection));
                debug!(
                    session = %connection.id,
                    tag = %connection.tag,
                    "Connection registered"
                );
                Ok(connection)
            }
        }
    }

    /// Unregister a connection. Unknown sessions are ignored.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(id).map(|(_, c)| c);
        if removed.is_some() {
            debug!(session = %id, "Connection unregistered");
        }
        removed
    }

    /// Look up a connection by session ID.
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Check whether a session is registered.
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Take a point-in-time copy of the registered connections.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            connections: self
                .connections
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect(),
        }
    }

    /// Count the connections a target currently addresses.
    #[must_use]
    pub fn count_for(&self, target: &RoutingTarget) -> usize {
        self.connections
            .iter()
            .filter(|entry| target.matches(entry.tag().as_str()))
            .count()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let tags: HashSet<String> = self
            .connections
            .iter()
            .map(|entry| entry.tag().as_str().to_lowercase())
            .collect();
        RegistryStats {
            connection_count: self.connections.len(),
            tag_count: tags.len(),
        }
    }
}
