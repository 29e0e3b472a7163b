//! Notification messages.
//!
//! A notification is created once per broadcast and shared by reference
//! with every matching connection.

use crate::registry::SessionId;
use crate::routing::{RecipientTag, RoutingTarget};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique message identifier.
pub type MessageId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a process-unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Announcement sent when a connection starts listening for a tag.
#[must_use]
pub fn listen_announcement(tag: &RecipientTag) -> String {
    format!("Listen [{}] Notifications!", tag)
}

/// Announcement sent when a connection stops listening for a tag.
#[must_use]
pub fn stop_announcement(tag: &RecipientTag) -> String {
    format!("Stop listen [{}] notifications!", tag)
}

/// A notification routed to every connection matching its target.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Unique message identifier.
    pub id: MessageId,
    /// Session that sent the notification, if it came from a connection.
    pub source: Option<SessionId>,
    /// Who the notification is addressed to.
    pub target: RoutingTarget,
    /// Opaque text payload.
    pub payload: Arc<str>,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Notification {
    /// Create a new notification.
    #[must_use]
    pub fn new(target: RoutingTarget, payload: impl Into<Arc<str>>) -> Self {
        Self {
            id: generate_message_id(),
            source: None,
            target,
            payload: payload.into(),
            timestamp: now_millis(),
        }
    }

    /// Attach the sending session.
    #[must_use]
    pub fn with_source(mut self, source: SessionId) -> Self {
        self.source = Some(source);
        self
    }

    /// Get the payload text.
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}
