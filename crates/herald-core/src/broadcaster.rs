//! Best-effort fan-out of notifications to matching connections.

use crate::error::DeliveryError;
use crate::message::Notification;
use crate::registry::{ConnectionRegistry, SessionId};
use crate::routing::RoutingTarget;
use serde::Serialize;
use std::sync::Arc;
use tracing::{trace, warn};

/// A single failed delivery within a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryFailure {
    /// Session the notification could not be handed to.
    pub session: SessionId,
    /// Why the delivery failed.
    pub reason: DeliveryError,
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryReport {
    /// Connections whose tag matched the target.
    pub matched: usize,
    /// Matched connections the notification was handed to.
    pub delivered: usize,
    /// Matched connections the notification could not be handed to.
    pub failures: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    /// Sessions whose delivery failed.
    #[must_use]
    pub fn failed_sessions(&self) -> Vec<&SessionId> {
        self.failures.iter().map(|f| &f.session).collect()
    }

    /// Whether every matched connection was delivered to.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Delivers notifications to the connections of one registry.
///
/// Delivery works on a [`Snapshot`](crate::Snapshot), so no registry lock is
/// held while sending. A connection that closes mid-broadcast may still be
/// attempted and is then reported as failed.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    /// Create a broadcaster over a registry.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Get the registry this broadcaster delivers from.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Broadcast a text payload to every connection addressed by `target`.
    pub fn broadcast(&self, payload: impl Into<Arc<str>>, target: RoutingTarget) -> DeliveryReport {
        self.publish(Notification::new(target, payload))
    }

    /// Deliver a prepared notification to every connection its target addresses.
    ///
    /// Each delivery is independent: a failure is recorded and the remaining
    /// connections are still attempted. Failed connections are neither
    /// retried nor removed.
    pub fn publish(&self, notification: Notification) -> DeliveryReport {
        let snapshot = self.registry.snapshot();
        let notification = Arc::new(notification);
        let mut report = DeliveryReport::default();

        for connection in snapshot
            .iter()
            .filter(|c| notification.target.matches(c.tag().as_str()))
        {
            report.matched += 1;
            match connection.send(Arc::clone(&notification)) {
                Ok(()) => report.delivered += 1,
                Err(reason) => {
                    warn!(
                        session = %connection.id(),
                        tag = %connection.tag(),
                        message = notification.id,
                        error = %reason,
                        "Delivery failed"
                    );
                    report.failures.push(DeliveryFailure {
                        session: connection.id().clone(),
                        reason,
                    });
                }
            }
        }

        trace!(
            target_tag = %notification.target,
            message = notification.id,
            matched = report.matched,
            delivered = report.delivered,
            "Broadcast complete"
        );

        report
    }
}
