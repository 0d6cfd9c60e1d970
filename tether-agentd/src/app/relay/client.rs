use crate::app::kill_switch::KillSwitch;
use crate::app::operations::OperationPort;
use crate::domain::audit::Origin;
use crate::identity::AgentIdentity;
use crate::telemetry::AgentMetrics;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_proto::{
    ControlFrame, ErrorBody, ErrorCode, FrameError, RelayFrame, RelayRequest, RelayResponse,
    USER_HEADER,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub url: String,
    pub keepalive_interval: Duration,
    /// Silence longer than this means the relay is gone.
    pub keepalive_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl RelaySettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            keepalive_interval: Duration::from_secs(15),
            keepalive_timeout: Duration::from_secs(45),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Shared view of whether the relay socket is currently open.
#[derive(Clone, Default)]
pub struct RelayStatus(Arc<AtomicBool>);

impl RelayStatus {
    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn set(&self, connected: bool) {
        self.0.store(connected, Ordering::Relaxed);
    }
}

/// How a connected session ended.
enum SessionEnd {
    Killed,
    Closed,
    Silent,
}

/// Spawns the relay loop; it runs until the kill switch is engaged.
pub fn spawn<P: OperationPort + 'static>(
    port: Arc<P>,
    identity: AgentIdentity,
    settings: RelaySettings,
    kill_switch: KillSwitch,
    status: RelayStatus,
    metrics: Option<Arc<AgentMetrics>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client = RelayClient {
            port,
            identity,
            settings,
            kill_switch,
            status,
            metrics,
        };
        client.run().await
    })
}

struct RelayClient<P: OperationPort> {
    port: Arc<P>,
    identity: AgentIdentity,
    settings: RelaySettings,
    kill_switch: KillSwitch,
    status: RelayStatus,
    metrics: Option<Arc<AgentMetrics>>,
}

impl<P: OperationPort + 'static> RelayClient<P> {
    async fn run(self) {
        let mut delay = self.settings.reconnect_min;
        while !self.kill_switch.is_engaged() {
            info!(url = %self.settings.url, "relay: connecting");
            let outcome = self.connect_and_serve().await;
            self.status.set(false);
            match outcome {
                Ok(SessionEnd::Killed) => {
                    info!("relay: closed by kill switch");
                    return;
                }
                Ok(SessionEnd::Closed) => {
                    info!("relay: connection closed");
                    delay = self.settings.reconnect_min;
                }
                Ok(SessionEnd::Silent) => {
                    warn!(
                        timeout_secs = self.settings.keepalive_timeout.as_secs(),
                        "relay: no traffic within keep-alive timeout"
                    );
                    delay = self.settings.reconnect_min;
                }
                Err(err) => {
                    warn!(error = %format!("{err:#}"), delay_ms = delay.as_millis() as u64, "relay: connection failed");
                }
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_relay_reconnect();
            }
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.kill_switch.engaged() => return,
            }
            delay = (delay * 2).min(self.settings.reconnect_max);
        }
    }

    async fn connect_and_serve(&self) -> Result<SessionEnd> {
        let mut request = self
            .settings
            .url
            .as_str()
            .into_client_request()
            .context("building relay request")?;
        let headers = request.headers_mut();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.identity.shared_secret()))
                .context("encoding shared secret header")?,
        );
        headers.insert(
            USER_HEADER,
            HeaderValue::from_str(self.identity.user_id()).context("encoding user header")?,
        );

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .context("connecting to relay")?;
        let (mut sink, mut stream) = socket.split();

        let announcement = RelayFrame::from(ControlFrame::AgentMetadata(self.identity.metadata()));
        sink.send(Message::Text(announcement.to_text()?.into()))
            .await
            .context("sending agent metadata")?;
        self.status.set(true);
        info!(user_id = self.identity.user_id(), "relay: connected");

        let (out_tx, mut out_rx) = mpsc::channel::<RelayFrame>(OUTBOUND_CAPACITY);
        let mut keepalive = interval(self.settings.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.tick().await;
        let mut last_seen = Instant::now();
        let killed = self.kill_switch.engaged();
        tokio::pin!(killed);

        loop {
            tokio::select! {
                biased;
                _ = &mut killed => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Killed);
                }
                Some(frame) = out_rx.recv() => {
                    sink.send(Message::Text(frame.to_text()?.into())).await?;
                }
                _ = keepalive.tick() => {
                    if last_seen.elapsed() > self.settings.keepalive_timeout {
                        return Ok(SessionEnd::Silent);
                    }
                    sink.send(Message::Text(RelayFrame::from(ControlFrame::Ping).to_text()?.into())).await?;
                }
                message = stream.next() => {
                    let Some(message) = message else {
                        return Ok(SessionEnd::Closed);
                    };
                    let message = message.context("reading from relay")?;
                    last_seen = Instant::now();
                    match message {
                        Message::Text(text) => match classify(&text) {
                            Inbound::Request(request) => self.dispatch(request, out_tx.clone()),
                            Inbound::Reply(frame) => {
                                sink.send(Message::Text(frame.to_text()?.into())).await?;
                            }
                            Inbound::Ignore => {}
                        },
                        Message::Close(_) => return Ok(SessionEnd::Closed),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Runs a relayed request on its own task. The task is not tied to the
    /// socket: losing the relay does not cancel work already started.
    fn dispatch(&self, request: RelayRequest, out_tx: mpsc::Sender<RelayFrame>) {
        let port = self.port.clone();
        tokio::spawn(async move {
            let id = request.id.clone();
            let response = respond(port.as_ref(), request).await;
            if out_tx.send(response.into()).await.is_err() {
                debug!(%id, "relay: dropped response for closed session");
            }
        });
    }
}

enum Inbound {
    Request(RelayRequest),
    Reply(RelayFrame),
    Ignore,
}

fn classify(text: &str) -> Inbound {
    match RelayFrame::parse(text) {
        Ok(RelayFrame::Request(request)) => Inbound::Request(request),
        Ok(RelayFrame::Control(ControlFrame::Ping)) => {
            Inbound::Reply(RelayFrame::from(ControlFrame::Pong))
        }
        Ok(RelayFrame::Control(ControlFrame::Pong)) => Inbound::Ignore,
        Ok(other) => {
            warn!(frame = ?other, "relay: unexpected frame");
            Inbound::Ignore
        }
        Err(FrameError::InvalidRequest { id: Some(id), source }) => {
            warn!(%id, error = %source, "relay: rejecting malformed request");
            Inbound::Reply(
                RelayResponse::failure(
                    id,
                    ErrorBody::new(ErrorCode::InvalidRequest, source.to_string()),
                )
                .into(),
            )
        }
        Err(err) => {
            warn!(error = %err, "relay: ignoring unreadable frame");
            Inbound::Ignore
        }
    }
}

async fn respond<P: OperationPort + ?Sized>(port: &P, request: RelayRequest) -> RelayResponse {
    let RelayRequest { id, operation } = request;
    match port.perform(Origin::Relay, operation).await {
        Ok(output) => match serde_json::to_value(&output) {
            Ok(data) => RelayResponse::success(id, data),
            Err(err) => RelayResponse::failure(
                id,
                ErrorBody::new(ErrorCode::ExecutionFailed, err.to_string()),
            ),
        },
        Err(err) => RelayResponse::failure(id, err.to_body()),
    }
}
