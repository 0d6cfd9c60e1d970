use crate::app::registry::ConnectionRegistry;
use crate::app::relay_hub::{RelayError, RelayHub, DEFAULT_RELAY_TIMEOUT};
use crate::ports::agent_http::{AgentHttp, DirectCallError};
use crate::ports::credentials::CredentialStore;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tether_proto::{ErrorBody, ErrorCode, ExecArgs, Operation};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_DIRECT_TIMEOUT: Duration = Duration::from_secs(30);
/// The agent's own default for `exec.run` without `timeoutMs`.
const AGENT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);
/// Headroom for the agent to report an exec timeout before we give up.
const EXEC_MARGIN: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Http,
    Relay,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutedResponse {
    pub transport: Transport,
    pub data: Value,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("agent for {user_id} is unavailable: {detail}")]
    AgentUnavailable { user_id: String, detail: String },
    #[error("agent did not answer within {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Busy(String),
    /// Authoritative answer from the agent; never retried on another path.
    #[error("{0}")]
    Agent(ErrorBody),
}

impl RouteError {
    fn unavailable(user_id: &str, detail: impl Into<String>) -> Self {
        RouteError::AgentUnavailable {
            user_id: user_id.to_string(),
            detail: detail.into(),
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        match self {
            RouteError::AgentUnavailable { .. } => {
                ErrorBody::new(ErrorCode::AgentUnavailable, self.to_string())
            }
            RouteError::Timeout(_) => ErrorBody::new(ErrorCode::Timeout, self.to_string()),
            RouteError::Busy(message) => ErrorBody::new(ErrorCode::Busy, message.clone()),
            RouteError::Agent(body) => body.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub direct_timeout: Duration,
    pub relay_timeout: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            direct_timeout: DEFAULT_DIRECT_TIMEOUT,
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
        }
    }
}

/// Chooses the transport for each operation from the cached connection
/// status. It never retries; the only second attempt is the relay after a
/// direct failure that is safe to replay.
pub struct TransportRouter {
    registry: Arc<ConnectionRegistry>,
    hub: Arc<RelayHub>,
    client: Arc<dyn AgentHttp>,
    credentials: Arc<dyn CredentialStore>,
    settings: RouterSettings,
}

impl TransportRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        hub: Arc<RelayHub>,
        client: Arc<dyn AgentHttp>,
        credentials: Arc<dyn CredentialStore>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            registry,
            hub,
            client,
            credentials,
            settings,
        }
    }

    pub async fn request_operation(
        &self,
        user_id: &str,
        operation: Operation,
    ) -> Result<RoutedResponse, RouteError> {
        let status = self.registry.status(user_id);
        debug!(user_id, %status, operation = operation.name(), "routing operation");

        if status.has_direct() {
            match self.try_direct(user_id, &operation).await {
                Some(Ok(data)) => {
                    return Ok(RoutedResponse {
                        transport: Transport::Http,
                        data,
                    })
                }
                Some(Err(DirectCallError::Agent(body))) => return Err(RouteError::Agent(body)),
                Some(Err(err)) => {
                    self.registry.record_health_probe(user_id, false);
                    let maybe_applied = !err.before_delivery() && !operation.is_read_only();
                    warn!(
                        user_id,
                        operation = operation.name(),
                        error = %err,
                        maybe_applied,
                        "direct call failed; falling back to relay"
                    );
                }
                None => {}
            }
        }

        if !self.hub.is_attached(user_id) {
            return Err(RouteError::unavailable(user_id, "no usable transport"));
        }
        let timeout = deadline(&operation, self.settings.relay_timeout);
        match self.hub.round_trip(user_id, operation, timeout).await {
            Ok(data) => Ok(RoutedResponse {
                transport: Transport::Relay,
                data,
            }),
            Err(RelayError::Remote(body)) => Err(RouteError::Agent(body)),
            Err(RelayError::Timeout(after)) => Err(RouteError::Timeout(after)),
            Err(RelayError::Busy(full)) => Err(RouteError::Busy(full.to_string())),
            Err(err @ (RelayError::NotConnected(_) | RelayError::SessionClosed(_))) => {
                Err(RouteError::unavailable(user_id, err.to_string()))
            }
        }
    }

    /// `None` when the direct path cannot be attempted at all.
    async fn try_direct(
        &self,
        user_id: &str,
        operation: &Operation,
    ) -> Option<Result<Value, DirectCallError>> {
        let port = self.registry.http_port(user_id)?;
        let Some(secret) = self.credentials.shared_secret(user_id) else {
            warn!(user_id, "no credentials for direct call");
            return None;
        };
        let timeout = deadline(operation, self.settings.direct_timeout);
        Some(self.client.call(port, &secret, operation, timeout).await)
    }
}

/// Waiting budget for one attempt. Exec calls get their own timeout plus
/// headroom so the agent's answer arrives before ours expires.
fn deadline(operation: &Operation, base: Duration) -> Duration {
    match operation {
        Operation::Exec(ExecArgs { timeout_ms, .. }) => {
            let exec = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(AGENT_EXEC_TIMEOUT);
            base.max(exec + EXEC_MARGIN)
        }
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::credentials::InMemoryCredentialStore;
    use crate::app::pending::DEFAULT_MAX_PENDING;
    use crate::app::relay_hub::SessionTicket;
    use crate::domain::connection::ConnectionStatus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tether_proto::{AgentMetadata, ListArgs, RelayFrame, RelayResponse, WriteArgs};

    #[derive(Clone, Copy)]
    enum Direct {
        Ok,
        Refused,
        TimedOut,
        Denied,
    }

    struct FakeAgent {
        direct: Mutex<Direct>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FakeAgent {
        fn new(direct: Direct) -> Arc<Self> {
            Arc::new(Self {
                direct: Mutex::new(direct),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AgentHttp for FakeAgent {
        async fn probe(&self, _port: u16) -> bool {
            true
        }

        async fn call(
            &self,
            _port: u16,
            _secret: &str,
            operation: &Operation,
            timeout: Duration,
        ) -> Result<Value, DirectCallError> {
            self.calls.lock().unwrap().push(operation.name());
            match *self.direct.lock().unwrap() {
                Direct::Ok => Ok(json!({"via": "http"})),
                Direct::Refused => Err(DirectCallError::Refused("connection refused".into())),
                Direct::TimedOut => Err(DirectCallError::TimedOut(timeout)),
                Direct::Denied => Err(DirectCallError::Agent(
                    ErrorBody::new(ErrorCode::PermissionDenied, "denied")
                        .with_reason("safe-mode-readonly"),
                )),
            }
        }
    }

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        hub: Arc<RelayHub>,
        agent: Arc<FakeAgent>,
        router: TransportRouter,
    }

    fn fixture(direct: Direct) -> Fixture {
        let registry = Arc::new(ConnectionRegistry::default());
        let hub = Arc::new(RelayHub::new(registry.clone(), DEFAULT_MAX_PENDING));
        let agent = FakeAgent::new(direct);
        let credentials = Arc::new(InMemoryCredentialStore::new().with("alice", "secret"));
        let router = TransportRouter::new(
            registry.clone(),
            hub.clone(),
            agent.clone(),
            credentials,
            RouterSettings::default(),
        );
        Fixture {
            registry,
            hub,
            agent,
            router,
        }
    }

    fn metadata() -> AgentMetadata {
        AgentMetadata {
            home_directory: "/home/alice".into(),
            platform: "linux".into(),
            http_port: Some(7717),
        }
    }

    fn list() -> Operation {
        Operation::List(ListArgs {
            path: "/home/alice".into(),
        })
    }

    fn write() -> Operation {
        Operation::Write(WriteArgs {
            path: "/home/alice/notes.txt".into(),
            content: "hi".into(),
            encoding: Default::default(),
            append: false,
        })
    }

    fn answer_over_relay(hub: Arc<RelayHub>, mut ticket: SessionTicket) {
        tokio::spawn(async move {
            while let Some(frame) = ticket.outbound.recv().await {
                if let RelayFrame::Request(request) = frame {
                    hub.deliver("alice", RelayResponse::success(request.id, json!({"via": "relay"})));
                }
            }
        });
    }

    #[tokio::test]
    async fn healthy_direct_path_is_preferred() {
        let f = fixture(Direct::Ok);
        let _ticket = f.hub.attach("alice", metadata());
        f.registry.record_health_probe("alice", true);

        let routed = f.router.request_operation("alice", list()).await.unwrap();
        assert_eq!(routed.transport, Transport::Http);
        assert_eq!(f.agent.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn http_only_still_routes_directly() {
        let f = fixture(Direct::Ok);
        let ticket = f.hub.attach("alice", metadata());
        f.registry.record_health_probe("alice", true);
        f.hub.detach("alice", ticket.id);
        assert_eq!(f.registry.status("alice"), ConnectionStatus::HttpOnly);

        let routed = f.router.request_operation("alice", write()).await.unwrap();
        assert_eq!(routed.transport, Transport::Http);
    }

    #[tokio::test]
    async fn refused_connection_falls_back_even_for_writes() {
        let f = fixture(Direct::Refused);
        let ticket = f.hub.attach("alice", metadata());
        answer_over_relay(f.hub.clone(), ticket);
        f.registry.record_health_probe("alice", true);

        let routed = f.router.request_operation("alice", write()).await.unwrap();
        assert_eq!(routed.transport, Transport::Relay);
        assert_eq!(f.registry.status("alice"), ConnectionStatus::RelayOnly);
    }

    #[tokio::test]
    async fn timed_out_direct_call_falls_back_for_reads_and_writes() {
        let f = fixture(Direct::TimedOut);
        let ticket = f.hub.attach("alice", metadata());
        answer_over_relay(f.hub.clone(), ticket);

        f.registry.record_health_probe("alice", true);
        let routed = f.router.request_operation("alice", list()).await.unwrap();
        assert_eq!(routed.transport, Transport::Relay);

        f.registry.record_health_probe("alice", true);
        let routed = f.router.request_operation("alice", write()).await.unwrap();
        assert_eq!(routed.transport, Transport::Relay);
        assert_eq!(routed.data["via"], "relay");
        assert_eq!(*f.agent.calls.lock().unwrap(), vec!["fs.list", "fs.write"]);
        assert_eq!(f.registry.status("alice"), ConnectionStatus::RelayOnly);
    }

    #[tokio::test]
    async fn timed_out_direct_call_without_relay_is_unavailable() {
        let f = fixture(Direct::TimedOut);
        let ticket = f.hub.attach("alice", metadata());
        f.registry.record_health_probe("alice", true);
        f.hub.detach("alice", ticket.id);

        let err = f.router.request_operation("alice", write()).await.unwrap_err();
        assert_eq!(err.to_body().code, ErrorCode::AgentUnavailable);
    }

    #[tokio::test]
    async fn agent_denials_are_final() {
        let f = fixture(Direct::Denied);
        let ticket = f.hub.attach("alice", metadata());
        answer_over_relay(f.hub.clone(), ticket);
        f.registry.record_health_probe("alice", true);

        let err = f.router.request_operation("alice", list()).await.unwrap_err();
        let body = err.to_body();
        assert_eq!(body.code, ErrorCode::PermissionDenied);
        assert_eq!(body.reason.as_deref(), Some("safe-mode-readonly"));
        assert_eq!(f.registry.status("alice"), ConnectionStatus::Full);
    }

    #[tokio::test]
    async fn no_transport_is_agent_unavailable() {
        let f = fixture(Direct::Ok);
        let err = f.router.request_operation("alice", list()).await.unwrap_err();
        assert_eq!(err.to_body().code, ErrorCode::AgentUnavailable);
        assert!(f.agent.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn relay_timeout_surfaces_as_timeout() {
        let f = fixture(Direct::Ok);
        let _ticket = f.hub.attach("alice", metadata());

        let err = f.router.request_operation("alice", list()).await.unwrap_err();
        assert!(matches!(err, RouteError::Timeout(after) if after == DEFAULT_RELAY_TIMEOUT));
        assert_eq!(f.hub.pending_len(), 0);
    }

    #[test]
    fn exec_deadline_covers_the_exec_timeout() {
        let exec = Operation::Exec(ExecArgs {
            command: "make".into(),
            cwd: None,
            timeout_ms: Some(120_000),
        });
        assert_eq!(
            deadline(&exec, Duration::from_secs(30)),
            Duration::from_secs(125)
        );
        assert_eq!(deadline(&list(), Duration::from_secs(30)), Duration::from_secs(30));
    }
}
