pub mod adapters;
pub mod app;
pub mod domain;
pub mod ports;

use adapters::http_agent::{HttpAgentClient, DEFAULT_PROBE_TIMEOUT};
use adapters::relay_socket::{self, RelaySocketSettings};
use anyhow::Context;
use app::health::{
    spawn_health_monitor, HealthMonitor, DEFAULT_PROBE_INTERVAL, DEFAULT_RECORD_RETENTION,
};
use app::pending::DEFAULT_MAX_PENDING;
use app::registry::{ConnectionRegistry, ConnectionSnapshot};
use app::relay_hub::RelayHub;
use app::router::{RouteError, RoutedResponse, RouterSettings, TransportRouter};
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use domain::connection::DEFAULT_STATUS_TTL;
use ports::agent_http::AgentHttp;
use ports::credentials::CredentialStore;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tether_proto::{ErrorBody, ErrorCode, Operation, SECRET_HEADER, USER_HEADER};
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
use tracing::{info, warn};

pub const DEFAULT_LISTEN: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8787);

#[derive(Debug, Clone)]
pub struct Settings {
    pub listen: SocketAddr,
    /// Address agents' loopback servers are reached on.
    pub agent_host: IpAddr,
    pub status_ttl: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// How long an agent with a closed relay and no healthy probe is kept.
    pub record_retention: Duration,
    pub router: RouterSettings,
    pub max_pending: usize,
    pub relay_socket: RelaySocketSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN,
            agent_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            status_ttl: DEFAULT_STATUS_TTL,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            record_retention: DEFAULT_RECORD_RETENTION,
            router: RouterSettings::default(),
            max_pending: DEFAULT_MAX_PENDING,
            relay_socket: RelaySocketSettings::default(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    registry: Arc<ConnectionRegistry>,
    hub: Arc<RelayHub>,
    router: Arc<TransportRouter>,
    monitor: Arc<HealthMonitor>,
    credentials: Arc<dyn CredentialStore>,
    relay_socket: RelaySocketSettings,
}

impl AppState {
    pub fn new(
        settings: &Settings,
        credentials: Arc<dyn CredentialStore>,
        client: Arc<dyn AgentHttp>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(settings.status_ttl));
        let hub = Arc::new(RelayHub::new(registry.clone(), settings.max_pending));
        let monitor = Arc::new(
            HealthMonitor::new(registry.clone(), client.clone())
                .with_retention(settings.record_retention),
        );
        let router = Arc::new(TransportRouter::new(
            registry.clone(),
            hub.clone(),
            client,
            credentials.clone(),
            settings.router.clone(),
        ));
        Self {
            registry,
            hub,
            router,
            monitor,
            credentials,
            relay_socket: settings.relay_socket.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/relay", get(relay_upgrade))
        .route("/users/:user_id/operations", post(request_operation))
        .route("/users/:user_id/status", get(connection_status))
        .with_state(state)
}

pub async fn run(settings: Settings, credentials: Arc<dyn CredentialStore>) -> anyhow::Result<()> {
    if settings.probe_interval >= settings.status_ttl {
        warn!(
            probe_interval_ms = settings.probe_interval.as_millis() as u64,
            ttl_ms = settings.status_ttl.as_millis() as u64,
            "probe interval is not shorter than the status TTL; live agents will flap"
        );
    }

    let client = HttpAgentClient::new(settings.agent_host, settings.probe_timeout)?;
    let state = AppState::new(&settings, credentials, Arc::new(client));

    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("binding {}", settings.listen))?;
    let local_addr = listener.local_addr()?;
    let monitor = spawn_health_monitor(state.monitor.clone(), settings.probe_interval);

    info!(
        listen = %local_addr,
        agent_host = %settings.agent_host,
        ttl_ms = settings.status_ttl.as_millis() as u64,
        "tether-bridge started"
    );

    let app = router(state);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving bridge http")?;

    monitor.shutdown().await;
    info!("tether-bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    if ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn healthz() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn relay_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let user_id = headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::unauthorized("missing user id"))?
        .to_string();
    let Some(secret) = presented_secret(&headers) else {
        warn!(%user_id, "relay: missing shared secret");
        return Err(ApiError::unauthorized("missing shared secret"));
    };
    if !state.credentials.verify(&user_id, secret) {
        warn!(%user_id, "relay: rejected agent credentials");
        return Err(ApiError::unauthorized("unknown agent or wrong shared secret"));
    }
    let upgrade = upgrade
        .map_err(|rejection| ApiError::new(ErrorCode::InvalidRequest, rejection.body_text()))?;

    let hub = state.hub.clone();
    let monitor = state.monitor.clone();
    let settings = state.relay_socket.clone();
    Ok(upgrade.on_upgrade(move |socket| relay_socket::serve(socket, user_id, hub, monitor, settings)))
}

fn presented_secret(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    bearer.or_else(|| {
        headers
            .get(SECRET_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
    })
}

async fn request_operation(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    payload: Result<Json<Operation>, JsonRejection>,
) -> Result<Json<RoutedResponse>, ApiError> {
    let Json(operation) = payload
        .map_err(|rejection| ApiError::new(ErrorCode::InvalidRequest, rejection.body_text()))?;
    let routed = state.router.request_operation(&user_id, operation).await?;
    Ok(Json(routed))
}

async fn connection_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<ConnectionSnapshot> {
    state.monitor.refresh_if_stale(&user_id).await;
    Json(state.registry.snapshot(&user_id))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::from_body(ErrorBody::new(code, message))
    }

    fn from_body(body: ErrorBody) -> Self {
        Self {
            status: StatusCode::from_u16(body.code.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body,
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }
}

impl From<RouteError> for ApiError {
    fn from(err: RouteError) -> Self {
        Self::from_body(err.to_body())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::credentials::InMemoryCredentialStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tether_proto::AgentMetadata;
    use tower::ServiceExt;

    fn state() -> AppState {
        let credentials = Arc::new(InMemoryCredentialStore::new().with("alice", "alice-secret"));
        let client = HttpAgentClient::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PROBE_TIMEOUT)
            .unwrap();
        AppState::new(&Settings::default(), credentials, Arc::new(client))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn healthz_is_open() {
        let (status, body) = send(
            router(state()),
            Request::get("/healthz").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn relay_rejects_bad_credentials_before_upgrading() {
        let request = Request::get("/relay")
            .header(USER_HEADER, "alice")
            .header(header::AUTHORIZATION, "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router(state()), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthorized");

        let request = Request::get("/relay")
            .header(SECRET_HEADER, "alice-secret")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(router(state()), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn operation_without_agent_is_unavailable() {
        let request = Request::post("/users/alice/operations")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"operation":"fs.list","path":"/home/alice"}"#))
            .unwrap();
        let (status, body) = send(router(state()), request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "agent-unavailable");
    }

    #[tokio::test]
    async fn unknown_operation_is_invalid() {
        let request = Request::post("/users/alice/operations")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"operation":"fs.chmod","path":"/"}"#))
            .unwrap();
        let (status, body) = send(router(state()), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid-request");
    }

    #[tokio::test]
    async fn status_reports_registry_snapshot() {
        let state = state();
        let (status, body) = send(
            router(state.clone()),
            Request::get("/users/alice/status").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "none");

        let _ticket = state.hub().attach(
            "alice",
            AgentMetadata {
                home_directory: "/home/alice".into(),
                platform: "linux".into(),
                http_port: None,
            },
        );
        let (_, body) = send(
            router(state),
            Request::get("/users/alice/status").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(body["status"], "relay-only");
        assert_eq!(body["relay"], "open");
        assert_eq!(body["platform"], "linux");
    }
}
