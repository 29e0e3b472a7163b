//! Error types for Herald.

use crate::registry::SessionId;
use serde::Serialize;
use thiserror::Error;

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A connection with this session id is already registered.
    #[error("Duplicate session: {0}")]
    DuplicateSession(SessionId),

    /// Invalid recipient tag.
    #[error("Invalid recipient tag: {0}")]
    InvalidTag(&'static str),

    /// The session is not registered or has already started closing.
    #[error("Session not open: {0}")]
    SessionNotOpen(SessionId),
}

/// Reason a single delivery within a broadcast failed.
///
/// Delivery failures are recorded in a [`DeliveryReport`](crate::DeliveryReport)
/// and never abort the rest of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryError {
    /// The connection's outbound queue has been dropped.
    #[error("Connection closed")]
    Closed,

    /// The connection's outbound queue is full (slow peer).
    #[error("Outbound queue full")]
    QueueFull,
}
