//! `RoomcastServer`: axum router, upgrade handlers, listener and shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::hub::{Hub, HubError};
use crate::metrics::{WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};
use crate::shutdown::ShutdownCoordinator;
use crate::upgrade::{ChatQuery, NotificationQuery, UpgradeError};
use crate::websocket::connection::{Connection, ConnectionAttrs, DisconnectReason};
use crate::websocket::transport::{Transport, WsTransport};

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Hub handle.
    pub hub: Hub,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Refuse new connections during shutdown or at capacity.
    async fn admit(&self) -> Result<(), UpgradeError> {
        if self.shutdown.is_shutting_down() {
            return Err(UpgradeError::ShuttingDown);
        }
        let snapshot = self
            .hub
            .snapshot()
            .await
            .map_err(|_| UpgradeError::HubUnavailable)?;
        if !self.config.admits(snapshot.connections) {
            warn!(
                connections = snapshot.connections,
                max = self.config.max_connections,
                "connection limit reached"
            );
            return Err(UpgradeError::AtCapacity);
        }
        Ok(())
    }
}

/// The roomcast server.
pub struct RoomcastServer {
    config: Arc<ServerConfig>,
    hub: Hub,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl RoomcastServer {
    /// Create a server and start its hub. Must be called inside a tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let (hub, _task) = Hub::spawn();
        Self {
            config: Arc::new(config),
            hub,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from this Prometheus handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    fn state(&self) -> AppState {
        AppState {
            hub: self.hub.clone(),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        }
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/ws/chat", get(chat_handler))
            .route("/ws/notifications", get(notifications_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state())
    }

    /// Bind `host:port` and serve until shutdown begins.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server error");
            }
        });
        info!(%addr, "roomcast listening");
        Ok((addr, handle))
    }

    /// Run a connection over an already-upgraded transport.
    ///
    /// For embedders that do their own accepting. Resolves to `None` if the
    /// hub refused the registration.
    pub fn attach<T: Transport>(
        &self,
        transport: T,
        attrs: ConnectionAttrs,
    ) -> JoinHandle<Option<DisconnectReason>> {
        let state = self.state();
        tokio::spawn(self.shutdown.track(serve_connection(state, transport, attrs)))
    }

    /// Stop accepting, close every connection and wait for them to drain.
    ///
    /// Returns `false` if connections were still open after the grace period.
    pub async fn graceful_shutdown(&self) -> bool {
        self.shutdown.shutdown();
        match self.hub.close_all().await {
            Ok(closed) => info!(closed, "closed all connections"),
            Err(e) => warn!(error = %e, "hub already stopped"),
        }
        self.shutdown.drain(self.config.shutdown_grace).await
    }

    /// Hub handle.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Register, run both pumps, and record the outcome.
async fn serve_connection<T: Transport>(
    state: AppState,
    transport: T,
    attrs: ConnectionAttrs,
) -> Option<DisconnectReason> {
    let (connection, handle) = Connection::new(attrs.clone(), state.config.send_queue_capacity);
    let id = connection.id().clone();
    let user_id = attrs.user_id.as_ref().map(|u| u.as_str().to_owned());
    let room_id = attrs.room_id.as_ref().map(|r| r.as_str().to_owned());

    match state.hub.register(handle).await {
        Ok(_) => {}
        Err(HubError::ShuttingDown) => {
            info!(conn_id = %id, "registration refused, shutting down");
            return None;
        }
        Err(e) => {
            warn!(conn_id = %id, error = %e, "registration failed");
            return None;
        }
    }
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    info!(conn_id = %id, ?user_id, ?room_id, "client connected");

    let reason = connection
        .run(transport, state.hub.clone(), state.config.keepalive.clone())
        .await;

    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.kind()).increment(1);
    if reason.is_graceful() {
        info!(conn_id = %id, %reason, "client disconnected");
    } else {
        warn!(conn_id = %id, %reason, "client dropped");
    }
    Some(reason)
}

async fn accept(
    state: AppState,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    attrs: ConnectionAttrs,
) -> Response {
    if let Err(e) = state.admit().await {
        return e.into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(%rejection, "websocket upgrade rejected");
            return rejection.into_response();
        }
    };

    let limit = state.config.keepalive.max_message_size;
    let shutdown = Arc::clone(&state.shutdown);
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_failed_upgrade(|error| warn!(%error, "websocket upgrade failed"))
        .on_upgrade(move |socket| {
            let fut = serve_connection(state, WsTransport::new(socket), attrs);
            shutdown.track(async move {
                let _ = fut.await;
            })
        })
}

/// GET /ws (anonymous, no room)
async fn ws_handler(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    accept(state, ws, ConnectionAttrs::anonymous()).await
}

/// GET /ws/chat?room_id=&user_id=
async fn chat_handler(
    State(state): State<AppState>,
    Query(query): Query<ChatQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match query.into_attrs() {
        Ok(attrs) => accept(state, ws, attrs).await,
        Err(e) => e.into_response(),
    }
}

/// GET /ws/notifications?user_id=
async fn notifications_handler(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match query.into_attrs() {
        Ok(attrs) => accept(state, ws, attrs).await,
        Err(e) => e.into_response(),
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let snapshot = state.hub.snapshot().await.ok();
    let resp = health::health_check(
        state.start_time,
        snapshot,
        state.shutdown.is_shutting_down(),
    );
    let status = if resp.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(resp))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::transport::{Frame, memory_pair};
    use axum::body::Body;
    use axum::http::Request;
    use roomcast_core::ids::{RoomId, UserId};
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = RoomcastServer::new(ServerConfig::default());
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert!(body["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_reports_shutdown() {
        let server = RoomcastServer::new(ServerConfig::default());
        assert!(server.graceful_shutdown().await);
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "shutting_down");
    }

    #[tokio::test]
    async fn chat_without_params_is_bad_request() {
        let server = RoomcastServer::new(ServerConfig::default());
        let (status, body) = get_json(server.router(), "/ws/chat?room_id=general").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "room_id and user_id are required");
    }

    #[tokio::test]
    async fn notifications_without_user_is_bad_request() {
        let server = RoomcastServer::new(ServerConfig::default());
        let (status, body) = get_json(server.router(), "/ws/notifications").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "user_id is required");
    }

    #[tokio::test]
    async fn plain_get_on_ws_is_not_upgraded() {
        let server = RoomcastServer::new(ServerConfig::default());
        let (status, _) = get_json(server.router(), "/ws").await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn upgrade_refused_during_shutdown() {
        let server = RoomcastServer::new(ServerConfig::default());
        server.shutdown().shutdown();
        let (status, body) =
            get_json(server.router(), "/ws/chat?room_id=general&user_id=u1").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "server is shutting down");
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let server = RoomcastServer::new(ServerConfig::default());
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = RoomcastServer::new(ServerConfig::default());
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn attached_transport_is_registered_and_greeted() {
        let server = RoomcastServer::new(ServerConfig::default());
        let (transport, mut peer) = memory_pair();
        let attrs = ConnectionAttrs::new(UserId::new("u1"), RoomId::new("general"));
        let task = server.attach(transport, attrs);

        let Some(Frame::Text(greeting)) = peer.recv().await else {
            panic!("expected greeting");
        };
        assert!(greeting.contains("Successfully connected to WebSocket"));
        assert_eq!(server.hub().snapshot().await.unwrap().connections, 1);

        peer.hang_up();
        assert_eq!(task.await.unwrap(), Some(DisconnectReason::PeerClosed));
        assert_eq!(server.hub().snapshot().await.unwrap().connections, 0);
    }

    #[tokio::test]
    async fn graceful_shutdown_closes_attached_connections() {
        let server = RoomcastServer::new(ServerConfig::default());
        let (transport, mut peer) = memory_pair();
        let task = server.attach(transport, ConnectionAttrs::anonymous());
        let _greeting = peer.recv().await;

        assert!(server.graceful_shutdown().await);
        assert_eq!(peer.recv().await, Some(Frame::Close));
        assert_eq!(task.await.unwrap(), Some(DisconnectReason::QueueClosed));
    }

    #[tokio::test]
    async fn attach_after_shutdown_is_refused() {
        let server = RoomcastServer::new(ServerConfig::default());
        assert!(server.graceful_shutdown().await);
        let (transport, _peer) = memory_pair();
        let task = server.attach(transport, ConnectionAttrs::anonymous());
        assert_eq!(task.await.unwrap(), None);
    }
}
