//! Connection handlers for Herald server.
//!
//! This module is the transport side of the relay: it accepts WebSocket
//! upgrades, feeds connect/message/close events into the
//! [`ConnectionLifecycle`], and drains each connection's outbound queue.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use herald_core::{
    Broadcaster, ConnectionLifecycle, ConnectionRegistry, DeliveryReport, RecipientTag,
    RoutingTarget, SessionId,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Connection lifecycle, owning the registry and broadcaster.
    pub lifecycle: ConnectionLifecycle,
    /// Server configuration.
    pub config: Config,
    /// Connection slots held by accepted upgrades.
    connection_slots: Arc<AtomicUsize>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            lifecycle: ConnectionLifecycle::new(Broadcaster::new(registry)),
            config,
            connection_slots: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve one of `limits.max_connections` slots.
    ///
    /// Returns `None` when every slot is taken. The slot is released when
    /// the returned guard is dropped.
    #[must_use]
    pub fn try_reserve_slot(&self) -> Option<ConnectionSlot> {
        let max = self.config.limits.max_connections;
        self.connection_slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;
        Some(ConnectionSlot {
            slots: Arc::clone(&self.connection_slots),
        })
    }

    /// Number of reserved connection slots.
    #[must_use]
    pub fn reserved_slots(&self) -> usize {
        self.connection_slots.load(Ordering::SeqCst)
    }
}

/// A reserved connection slot, released on drop.
#[derive(Debug)]
pub struct ConnectionSlot {
    slots: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.slots.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Build the HTTP/WebSocket router.
pub fn app(state: Arc<AppState>) -> Router {
    let max_message_size = state.config.limits.max_message_size;

    Router::new()
        .route(&state.config.websocket_route(), get(ws_handler))
        .route(
            "/notify/:to",
            post(notify_handler).layer(DefaultBodyLimit::max(max_message_size)),
        )
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let state = Arc::new(AppState::new(config));
    let websocket_route = state.config.websocket_route();
    let app = app(state);

    let listener = TcpListener::bind(addr).await?;

    info!("Herald server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, websocket_route);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.lifecycle.registry().stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connection_count,
        "recipient_tags": stats.tag_count,
    }))
}

/// Out-of-band broadcast: POST a text body to `/notify/{to}`.
async fn notify_handler(
    Path(to): Path<String>,
    State(state): State<Arc<AppState>>,
    body: String,
) -> Json<DeliveryReport> {
    let start = Instant::now();
    metrics::record_message(body.len(), "http");

    let target = RoutingTarget::parse(&to);
    let report = state.lifecycle.broadcaster().broadcast(body, target);

    metrics::record_delivery(&report);
    metrics::record_latency(start.elapsed().as_secs_f64());
    debug!(
        target_tag = %to,
        matched = report.matched,
        delivered = report.delivered,
        "HTTP broadcast"
    );

    Json(report)
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(to): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let tag = match RecipientTag::new(to) {
        Ok(tag) => tag,
        Err(e) => {
            metrics::record_error("invalid_tag");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    // A failed upgrade drops the callback, and the slot with it.
    let slot = match state.try_reserve_slot() {
        Some(slot) => slot,
        None => {
            warn!(tag = %tag, "Connection limit reached");
            metrics::record_error("connection_limit");
            return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
        }
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, tag, state, slot))
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    tag: RecipientTag,
    state: Arc<AppState>,
    _slot: ConnectionSlot,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let session = SessionId::generate();
    let (outbound, mut inbox) = mpsc::channel(state.config.limits.outbound_queue_capacity);
    let (mut sender, mut receiver) = socket.split();

    match state.lifecycle.on_connect(session.clone(), tag, outbound) {
        Ok(report) => metrics::record_delivery(&report),
        Err(e) => {
            error!(session = %session, error = %e, "Failed to register connection");
            metrics::record_error("register");
            return;
        }
    }
    metrics::set_active_tags(state.lifecycle.registry().stats().tag_count);

    loop {
        tokio::select! {
            biased;

            // Notifications routed to this connection
            Some(notification) = inbox.recv() => {
                metrics::record_message(notification.payload_size(), "outbound");
                if sender
                    .send(Message::Text(notification.payload().to_owned()))
                    .await
                    .is_err()
                {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&state, &session, text);
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => handle_inbound(&state, &session, text),
                        Err(_) => {
                            warn!(session = %session, "Dropping non UTF-8 binary message");
                            metrics::record_error("invalid_utf8");
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(session = %session, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session = %session, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(session = %session, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    if let Some(report) = state.lifecycle.on_disconnect(&session) {
        metrics::record_delivery(&report);
    }
    metrics::set_active_tags(state.lifecycle.registry().stats().tag_count);

    debug!(session = %session, "WebSocket disconnected");
}

/// Route an application message from a connection.
fn handle_inbound(state: &AppState, session: &SessionId, text: String) {
    let start = Instant::now();
    metrics::record_message(text.len(), "inbound");

    match state.lifecycle.on_message(session, text) {
        Ok(report) => {
            metrics::record_delivery(&report);
            debug!(session = %session, recipients = report.delivered, "Routed");
        }
        Err(e) => {
            warn!(session = %session, error = %e, "Inbound message rejected");
            metrics::record_error("inbound");
        }
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_tungstenite::{
        connect_async, tungstenite::Error as WsError, tungstenite::Message as WsMessage,
        MaybeTlsStream, WebSocketStream,
    };
    use tower::ServiceExt;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.host = "127.0.0.1".to_string();
        config.port = 0;
        config.metrics.enabled = false;
        config
    }

    async fn spawn_server(config: Config) -> (SocketAddr, Arc<AppState>) {
        let state = Arc::new(AppState::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (addr, state)
    }

    async fn connect(addr: SocketAddr, to: &str) -> Client {
        let (client, _) = connect_async(format!("ws://{addr}/ws/notify/{to}"))
            .await
            .unwrap();
        client
    }

    async fn next_text(client: &mut Client) -> String {
        timeout(Duration::from_secs(5), async {
            loop {
                match client.next().await {
                    Some(Ok(WsMessage::Text(text))) => return text,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected websocket event: {other:?}"),
                }
            }
        })
        .await
        .expect("timed out waiting for a message")
    }

    async fn assert_silent(client: &mut Client) {
        let res = timeout(Duration::from_millis(200), client.next()).await;
        assert!(res.is_err(), "unexpected message: {res:?}");
    }

    async fn wait_for_connections(state: &AppState, expected: usize) {
        timeout(Duration::from_secs(5), async {
            while state.lifecycle.registry().len() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("registry never reached the expected size");
    }

    #[tokio::test]
    async fn test_notifications_stay_within_recipient() {
        let (addr, _state) = spawn_server(test_config()).await;

        let mut adam = connect(addr, "adam").await;
        assert_eq!(next_text(&mut adam).await, "Listen [adam] Notifications!");

        let mut anna = connect(addr, "anna").await;
        assert_eq!(next_text(&mut anna).await, "Listen [anna] Notifications!");

        let mut ben = connect(addr, "ben").await;
        assert_eq!(next_text(&mut ben).await, "Listen [ben] Notifications!");

        let to_adam = "Adam, here is your notification!)";
        adam.send(WsMessage::Text(to_adam.into())).await.unwrap();
        assert_eq!(next_text(&mut adam).await, to_adam);

        let to_anna = "Anna, here is your notification!)";
        anna.send(WsMessage::Text(to_anna.into())).await.unwrap();
        assert_eq!(next_text(&mut anna).await, to_anna);

        let to_ben = "Ben, here is your notification!)";
        ben.send(WsMessage::Text(to_ben.into())).await.unwrap();
        assert_eq!(next_text(&mut ben).await, to_ben);

        // Nobody hears anyone else's notifications.
        assert_silent(&mut adam).await;
        assert_silent(&mut anna).await;

        adam.close(None).await.unwrap();
        anna.close(None).await.unwrap();
        ben.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_announces_to_same_tag_and_unregisters() {
        let (addr, state) = spawn_server(test_config()).await;

        let mut ben = connect(addr, "ben").await;
        assert_eq!(next_text(&mut ben).await, "Listen [ben] Notifications!");

        let mut ben_upper = connect(addr, "BEN").await;
        assert_eq!(next_text(&mut ben_upper).await, "Listen [BEN] Notifications!");
        assert_eq!(next_text(&mut ben).await, "Listen [BEN] Notifications!");

        let mut anna = connect(addr, "anna").await;
        assert_eq!(next_text(&mut anna).await, "Listen [anna] Notifications!");
        wait_for_connections(&state, 3).await;

        ben.close(None).await.unwrap();

        assert_eq!(
            next_text(&mut ben_upper).await,
            "Stop listen [ben] notifications!"
        );
        wait_for_connections(&state, 2).await;
        assert_silent(&mut anna).await;
    }

    #[tokio::test]
    async fn test_wildcard_connection_reaches_everyone() {
        let (addr, _state) = spawn_server(test_config()).await;

        let mut monitor = connect(addr, "all").await;
        assert_eq!(next_text(&mut monitor).await, "Listen [all] Notifications!");

        let mut adam = connect(addr, "adam").await;
        assert_eq!(next_text(&mut adam).await, "Listen [adam] Notifications!");
        assert_silent(&mut monitor).await;

        monitor
            .send(WsMessage::Text("system maintenance".into()))
            .await
            .unwrap();
        assert_eq!(next_text(&mut monitor).await, "system maintenance");
        assert_eq!(next_text(&mut adam).await, "system maintenance");
    }

    #[tokio::test]
    async fn test_http_broadcast_returns_report() {
        let state = Arc::new(AppState::new(test_config()));
        let (tx, mut rx) = mpsc::channel(8);
        state
            .lifecycle
            .on_connect(SessionId::new("s1"), RecipientTag::new("adam").unwrap(), tx)
            .unwrap();
        rx.try_recv().unwrap();

        let response = app(Arc::clone(&state))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/notify/ADAM")
                    .body(Body::from("ping"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let report: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(report["matched"], 1);
        assert_eq!(report["delivered"], 1);
        assert_eq!(rx.try_recv().unwrap().payload(), "ping");
    }

    #[tokio::test]
    async fn test_health_reports_connections() {
        let state = Arc::new(AppState::new(test_config()));
        let (tx, _rx) = mpsc::channel(8);
        state
            .lifecycle
            .on_connect(SessionId::new("s1"), RecipientTag::new("adam").unwrap(), tx)
            .unwrap();

        let response = app(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["connections"], 1);
    }

    #[test]
    fn test_connection_slots_never_exceed_limit() {
        let mut config = test_config();
        config.limits.max_connections = 10;
        let state = AppState::new(config);

        let slots: Vec<ConnectionSlot> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        (0..50)
                            .filter_map(|_| state.try_reserve_slot())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });

        assert_eq!(slots.len(), 10);
        assert_eq!(state.reserved_slots(), 10);
        assert!(state.try_reserve_slot().is_none());

        drop(slots);
        assert_eq!(state.reserved_slots(), 0);
        assert!(state.try_reserve_slot().is_some());
    }

    #[tokio::test]
    async fn test_closed_connection_releases_slot() {
        let mut config = test_config();
        config.limits.max_connections = 1;
        let (addr, state) = spawn_server(config).await;

        let mut first = connect(addr, "adam").await;
        assert_eq!(next_text(&mut first).await, "Listen [adam] Notifications!");
        assert!(connect_async(format!("ws://{addr}/ws/notify/anna"))
            .await
            .is_err());

        first.close(None).await.unwrap();
        wait_for_connections(&state, 0).await;
        timeout(Duration::from_secs(5), async {
            while state.reserved_slots() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("slot was never released");

        let mut second = connect(addr, "anna").await;
        assert_eq!(next_text(&mut second).await, "Listen [anna] Notifications!");
    }

    #[tokio::test]
    async fn test_connection_limit_rejects_upgrade() {
        let mut config = test_config();
        config.limits.max_connections = 0;
        let (addr, _state) = spawn_server(config).await;

        let err = connect_async(format!("ws://{addr}/ws/notify/adam"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WsError::Http(ref response) if response.status().as_u16() == 503
        ));
    }
}
