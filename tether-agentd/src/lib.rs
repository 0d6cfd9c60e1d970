pub mod adapters;
pub mod app;
pub mod domain;
pub mod identity;
pub mod policy_engine;
pub mod ports;
pub mod telemetry;

use adapters::canonicalizer::FsCanonicalizer;
use adapters::executor::{ExecutorSettings, LocalExecutor, ShellCommandRunner};
use anyhow::{anyhow, Context};
use app::audit::{AuditLog, DEFAULT_AUDIT_CAPACITY};
use app::kill_switch::KillSwitch;
use app::operations::{OperationError, OperationService};
use app::relay::{RelaySettings, RelayStatus};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use domain::audit::{AuditEntry, Origin};
use domain::output::OperationOutput;
use identity::{AgentIdentity, IdentitySummary};
use policy_engine::PolicyEngine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_proto::{
    CreateArgs, DeleteArgs, ErrorBody, ErrorCode, ExecArgs, GrantView, ListArgs, Operation,
    PlanApproval, ReadArgs, TransferArgs, WriteArgs, SECRET_HEADER,
};
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
use tracing::{info, warn};

pub use adapters::executor::command_runner::DEFAULT_MAX_CONCURRENT;

pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);
/// How long `run` waits for the relay client once the grace period is over.
/// The client starts closing at the moment of the kill, so this is slack.
const RELAY_STOP_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct Settings {
    pub listen: SocketAddr,
    pub identity: AgentIdentity,
    pub relay: Option<RelaySettings>,
    pub executor: ExecutorSettings,
    pub max_concurrent_exec: usize,
    pub audit_capacity: usize,
    pub kill_grace: Duration,
    pub otlp_endpoint: Option<String>,
}

impl Settings {
    pub fn new(identity: AgentIdentity) -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], identity.http_port())),
            identity,
            relay: None,
            executor: ExecutorSettings::default(),
            max_concurrent_exec: DEFAULT_MAX_CONCURRENT,
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
            kill_grace: DEFAULT_KILL_GRACE,
            otlp_endpoint: None,
        }
    }
}

type AgentOperations = OperationService<LocalExecutor<ShellCommandRunner>>;

#[derive(Clone)]
pub struct AppState {
    operations: Arc<AgentOperations>,
    identity: Arc<AgentIdentity>,
    relay_status: RelayStatus,
    kill_grace: Duration,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        identity: AgentIdentity,
        settings: &Settings,
        metrics: Option<Arc<telemetry::AgentMetrics>>,
    ) -> Self {
        let home = identity.home_directory().to_path_buf();
        let policy = PolicyEngine::new(&home, Arc::new(FsCanonicalizer));
        let runner = Arc::new(ShellCommandRunner::new(settings.max_concurrent_exec));
        let executor = Arc::new(LocalExecutor::new(runner, settings.executor.clone()));
        let audit = Arc::new(AuditLog::new(settings.audit_capacity, metrics.clone()));
        let operations = OperationService::new(
            policy,
            executor,
            audit,
            KillSwitch::new(),
            home,
            metrics,
        );
        Self {
            operations: Arc::new(operations),
            identity: Arc::new(identity),
            relay_status: RelayStatus::default(),
            kill_grace: settings.kill_grace,
            started_at: Instant::now(),
        }
    }

    pub fn operations(&self) -> &Arc<AgentOperations> {
        &self.operations
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn kill_switch(&self) -> KillSwitch {
        self.operations.kill_switch().clone()
    }

    pub fn relay_status(&self) -> &RelayStatus {
        &self.relay_status
    }

    fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/status", get(status))
        .route("/logs", get(logs))
        .route("/fs/list", post(fs_list))
        .route("/fs/read", post(fs_read))
        .route("/fs/write", post(fs_write))
        .route("/fs/move", post(fs_move))
        .route("/fs/copy", post(fs_copy))
        .route("/fs/delete", post(fs_delete))
        .route("/fs/create", post(fs_create))
        .route("/execute", post(execute))
        .route("/plan/approve", post(approve_plan))
        .route("/kill", post(kill))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_secret));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    if !settings.listen.ip().is_loopback() {
        return Err(anyhow!(
            "refusing to listen on non-loopback address {}",
            settings.listen
        ));
    }

    let (metrics, provider) = if let Some(endpoint) = &settings.otlp_endpoint {
        let (provider, metrics) = telemetry::init_metrics(endpoint, "tether-agentd")?;
        (Some(Arc::new(metrics)), Some(provider))
    } else {
        (None, None)
    };

    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("binding {}", settings.listen))?;
    let local_addr = listener.local_addr()?;
    let identity = settings.identity.clone().with_http_port(local_addr.port());
    let state = AppState::new(identity, &settings, metrics.clone());

    let relay_task = settings.relay.clone().map(|relay| {
        app::relay::spawn(
            state.operations.clone(),
            state.identity().clone(),
            relay,
            state.kill_switch(),
            state.relay_status.clone(),
            metrics.clone(),
        )
    });

    info!(
        listen = %local_addr,
        user_id = state.identity().user_id(),
        relay = settings.relay.is_some(),
        "tether-agentd started"
    );

    let grace = settings.kill_grace;
    let app = router(state.clone());
    let server = async move { axum::serve(listener, app.into_make_service()).await };
    // In-flight responses get the grace period to flush. Anything still
    // running after it is abandoned.
    tokio::select! {
        result = server => result.context("serving agent http")?,
        _ = shutdown_signal(state, grace) => {
            info!(grace_ms = grace.as_millis() as u64, "grace period over");
        }
    }

    if let Some(task) = relay_task {
        if tokio::time::timeout(RELAY_STOP_WAIT, task).await.is_err() {
            warn!("relay client did not stop in time");
        }
    }

    if let Some(provider) = provider {
        if let Err(err) = telemetry::shutdown_metrics(provider) {
            warn!(%err, "failed to shut down metrics");
        }
    }

    info!("tether-agentd stopped");
    Ok(())
}

/// Resolves `grace` after the kill switch is engaged, by `/kill` or by an
/// interrupt signal.
async fn shutdown_signal(state: AppState, grace: Duration) {
    let kill_switch = state.kill_switch();
    let interrupted = async {
        if ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = interrupted => {
            info!("shutdown signal received");
            let _ = state.operations.kill(Origin::Local);
        }
        _ = kill_switch.engaged() => {}
    }
    tokio::time::sleep(grace).await;
}

async fn require_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let rejection = match presented_secret(request.headers()) {
        Some(secret) if state.identity.secret_matches(secret) => None,
        Some(_) => Some("shared secret does not match"),
        None => Some("missing shared secret"),
    };
    if let Some(message) = rejection {
        warn!(path = %request.uri().path(), message, "rejected unauthenticated request");
        return Err(ApiError::unauthorized(message));
    }
    Ok(next.run(request).await)
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

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    version: &'static str,
    #[serde(flatten)]
    grant: GrantView,
    identity: IdentitySummary,
    relay_connected: bool,
    shutting_down: bool,
    uptime_ms: u128,
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    if state.operations.is_shutting_down() {
        return Err(OperationError::ShuttingDown.into());
    }
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        grant: state.operations.grant().view(),
        identity: state.identity.summary(),
        relay_connected: state.relay_status.is_connected(),
        shutting_down: state.operations.is_shutting_down(),
        uptime_ms: state.uptime().as_millis(),
    }))
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct LogsResponse {
    entries: Vec<AuditEntry>,
}

async fn logs(
    State(state): State<AppState>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> Result<Json<LogsResponse>, ApiError> {
    let Query(query) = query.map_err(|rejection| {
        state
            .operations
            .reject_malformed(Origin::Http, "audit.read", rejection.body_text())
    })?;
    let entries = state.operations.audit_tail(query.limit)?;
    Ok(Json(LogsResponse { entries }))
}

async fn fs_list(
    State(state): State<AppState>,
    payload: Result<Json<ListArgs>, JsonRejection>,
) -> Result<Json<OperationOutput>, ApiError> {
    perform(&state, Operation::List(body(&state, "fs.list", payload)?)).await
}

async fn fs_read(
    State(state): State<AppState>,
    payload: Result<Json<ReadArgs>, JsonRejection>,
) -> Result<Json<OperationOutput>, ApiError> {
    perform(&state, Operation::Read(body(&state, "fs.read", payload)?)).await
}

async fn fs_write(
    State(state): State<AppState>,
    payload: Result<Json<WriteArgs>, JsonRejection>,
) -> Result<Json<OperationOutput>, ApiError> {
    perform(&state, Operation::Write(body(&state, "fs.write", payload)?)).await
}

async fn fs_move(
    State(state): State<AppState>,
    payload: Result<Json<TransferArgs>, JsonRejection>,
) -> Result<Json<OperationOutput>, ApiError> {
    perform(&state, Operation::Move(body(&state, "fs.move", payload)?)).await
}

async fn fs_copy(
    State(state): State<AppState>,
    payload: Result<Json<TransferArgs>, JsonRejection>,
) -> Result<Json<OperationOutput>, ApiError> {
    perform(&state, Operation::Copy(body(&state, "fs.copy", payload)?)).await
}

async fn fs_delete(
    State(state): State<AppState>,
    payload: Result<Json<DeleteArgs>, JsonRejection>,
) -> Result<Json<OperationOutput>, ApiError> {
    perform(&state, Operation::Delete(body(&state, "fs.delete", payload)?)).await
}

async fn fs_create(
    State(state): State<AppState>,
    payload: Result<Json<CreateArgs>, JsonRejection>,
) -> Result<Json<OperationOutput>, ApiError> {
    perform(&state, Operation::Create(body(&state, "fs.create", payload)?)).await
}

async fn execute(
    State(state): State<AppState>,
    payload: Result<Json<ExecArgs>, JsonRejection>,
) -> Result<Json<OperationOutput>, ApiError> {
    perform(&state, Operation::Exec(body(&state, "exec.run", payload)?)).await
}

async fn approve_plan(
    State(state): State<AppState>,
    payload: Result<Json<PlanApproval>, JsonRejection>,
) -> Result<Json<GrantView>, ApiError> {
    let approval = body(&state, "plan.approve", payload)?;
    let grant = state.operations.approve_plan(Origin::Http, approval)?;
    Ok(Json(grant))
}

async fn kill(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.operations.kill(Origin::Http)?;
    Ok(Json(json!({
        "status": "shutting-down",
        "graceMs": state.kill_grace.as_millis() as u64,
    })))
}

async fn perform(state: &AppState, operation: Operation) -> Result<Json<OperationOutput>, ApiError> {
    let output = state.operations.perform(Origin::Http, operation).await?;
    Ok(Json(output))
}

fn body<T>(
    state: &AppState,
    name: &str,
    payload: Result<Json<T>, JsonRejection>,
) -> Result<T, ApiError> {
    payload.map(|Json(value)| value).map_err(|rejection| {
        state
            .operations
            .reject_malformed(Origin::Http, name, rejection.body_text())
            .into()
    })
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

impl From<OperationError> for ApiError {
    fn from(err: OperationError) -> Self {
        Self::from_body(err.to_body())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
