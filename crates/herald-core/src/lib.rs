//! # herald-core
//!
//! Recipient-addressed broadcast routing for the Herald notification relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Registry** - Thread-safe set of open connections and their recipient tags
//! - **Routing** - Wildcard and case-insensitive recipient matching
//! - **Broadcaster** - Best-effort fan-out with per-connection delivery reports
//! - **Lifecycle** - Connect / message / disconnect handling and announcements
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│  Lifecycle  │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │                   ▲
//!                            ▼                   │ snapshot
//!                     ┌─────────────┐            │
//!                     │ Broadcaster │────────────┘
//!                     └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use herald_core::{
//!     Broadcaster, ConnectionLifecycle, ConnectionRegistry, RecipientTag, SessionId,
//! };
//! use tokio::sync::mpsc;
//!
//! let registry = Arc::new(ConnectionRegistry::new());
//! let lifecycle = ConnectionLifecycle::new(Broadcaster::new(registry));
//!
//! let (tx, mut rx) = mpsc::channel(16);
//! let session = SessionId::generate();
//! lifecycle
//!     .on_connect(session.clone(), RecipientTag::new("adam").unwrap(), tx)
//!     .unwrap();
//!
//! let announcement = rx.try_recv().unwrap();
//! assert_eq!(announcement.payload(), "Listen [adam] Notifications!");
//! ```

pub mod broadcaster;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod registry;
pub mod routing;

pub use broadcaster::{Broadcaster, DeliveryFailure, DeliveryReport};
pub use error::{DeliveryError, RouterError};
pub use lifecycle::ConnectionLifecycle;
pub use message::Notification;
pub use registry::{
    Connection, ConnectionRegistry, ConnectionState, Outbound, RegistryStats, SessionId, Snapshot,
};
pub use routing::{RecipientTag, RoutingTarget};
