//! Connection lifecycle: connect, message, disconnect.
//!
//! Transport events are turned into registry mutations and announcements.
//! A connection moves `Connecting -> Open -> Closed`; the listen
//! announcement is sent once it is registered, and the stop announcement is
//! sent before it is removed, so a connection listening to its own tag hears
//! both.

use crate::broadcaster::{Broadcaster, DeliveryReport};
use crate::error::RouterError;
use crate::message::{listen_announcement, stop_announcement, Notification};
use crate::registry::{Connection, ConnectionRegistry, ConnectionState, Outbound, SessionId};
use crate::routing::{RecipientTag, RoutingTarget};
use std::sync::Arc;
use tracing::{debug, info};

/// Handles transport lifecycle events for every connection.
#[derive(Debug, Clone)]
pub struct ConnectionLifecycle {
    broadcaster: Broadcaster,
}

impl ConnectionLifecycle {
    /// Create a lifecycle handler delivering through `broadcaster`.
    #[must_use]
    pub fn new(broadcaster: Broadcaster) -> Self {
        Self { broadcaster }
    }

    /// Get the broadcaster, e.g. for out-of-band broadcasts.
    #[must_use]
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Get the connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.broadcaster.registry()
    }

    /// Lifecycle state of a session. Unknown sessions report `Closed`.
    #[must_use]
    pub fn state(&self, session: &SessionId) -> ConnectionState {
        self.registry()
            .get(session)
            .map_or(ConnectionState::Closed, |c| c.state())
    }

    /// Register a freshly handshaken connection and announce it.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateSession`] if the session is already
    /// registered; nothing is announced in that case.
    pub fn on_connect(
        &self,
        session: SessionId,
        tag: RecipientTag,
        outbound: Outbound,
    ) -> Result<DeliveryReport, RouterError> {
        info!(session = %session, tag = %tag, "Connection opened");

        let connection = self
            .registry()
            .add(Connection::new(session, tag, outbound))?;
        connection.mark_open();

        Ok(self.announce(&connection, listen_announcement(connection.tag())))
    }

    /// Route an application message to the sender's own tag group.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::SessionNotOpen`] if the session is unknown or
    /// closing.
    pub fn on_message(
        &self,
        session: &SessionId,
        payload: impl Into<Arc<str>>,
    ) -> Result<DeliveryReport, RouterError> {
        let connection = self
            .registry()
            .get(session)
            .filter(|c| c.state() == ConnectionState::Open)
            .ok_or_else(|| RouterError::SessionNotOpen(session.clone()))?;

        let notification = Notification::new(RoutingTarget::for_tag(connection.tag()), payload)
            .with_source(session.clone());

        debug!(
            session = %session,
            tag = %connection.tag(),
            message = notification.id,
            bytes = notification.payload_size(),
            "Inbound message"
        );

        Ok(self.broadcaster.publish(notification))
    }

    /// Announce a closing connection and unregister it.
    ///
    /// Returns `None` for unknown sessions and repeated close notifications.
    pub fn on_disconnect(&self, session: &SessionId) -> Option<DeliveryReport> {
        let connection = self.registry().get(session)?;
        if !connection.mark_closed() {
            debug!(session = %session, "Duplicate close ignored");
            return None;
        }

        info!(session = %session, tag = %connection.tag(), "Connection closed");

        let report = self.announce(&connection, stop_announcement(connection.tag()));
        self.registry().remove(session);
        Some(report)
    }

    fn announce(&self, connection: &Connection, text: String) -> DeliveryReport {
        let notification = Notification::new(RoutingTarget::for_tag(connection.tag()), text)
            .with_source(connection.id().clone());
        let report = self.broadcaster.publish(notification);

        if !report.is_complete() {
            debug!(
                session = %connection.id(),
                failed = report.failures.len(),
                "Announcement partially delivered"
            );
        }

        report
    }
}
