use crate::app::health::HealthMonitor;
use crate::app::relay_hub::RelayHub;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tether_proto::{AgentMetadata, ControlFrame, RelayFrame};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RelaySocketSettings {
    /// How long a fresh socket may take to announce its metadata.
    pub metadata_wait: Duration,
    pub ping_interval: Duration,
    /// Silence longer than this closes the socket.
    pub idle_timeout: Duration,
}

impl Default for RelaySocketSettings {
    fn default() -> Self {
        Self {
            metadata_wait: Duration::from_secs(10),
            ping_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(45),
        }
    }
}

/// Drives one authenticated agent socket from metadata announcement to close.
pub async fn serve(
    socket: WebSocket,
    user_id: String,
    hub: Arc<RelayHub>,
    monitor: Arc<HealthMonitor>,
    settings: RelaySocketSettings,
) {
    let (mut sink, mut stream) = socket.split();

    let metadata = match timeout(settings.metadata_wait, await_metadata(&mut stream)).await {
        Ok(Some(metadata)) => metadata,
        Ok(None) => {
            debug!(%user_id, "relay: socket closed before announcing metadata");
            return;
        }
        Err(_) => {
            warn!(%user_id, wait_ms = settings.metadata_wait.as_millis() as u64, "relay: no metadata announcement");
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    let port = metadata.http_port;
    let mut ticket = hub.attach(&user_id, metadata);
    if let Some(port) = port {
        let monitor = monitor.clone();
        let user_id = user_id.clone();
        tokio::spawn(async move {
            monitor.probe_user(&user_id, port).await;
        });
    }

    let mut keepalive = interval(settings.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;
            frame = ticket.outbound.recv() => {
                let Some(frame) = frame else {
                    info!(%user_id, "relay: session superseded, closing socket");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                if let Err(err) = send_frame(&mut sink, &frame).await {
                    warn!(%user_id, error = %err, "relay: send failed");
                    break;
                }
            }
            _ = keepalive.tick() => {
                if last_seen.elapsed() > settings.idle_timeout {
                    warn!(%user_id, "relay: agent went silent");
                    break;
                }
                if send_frame(&mut sink, &RelayFrame::from(ControlFrame::Ping)).await.is_err() {
                    break;
                }
            }
            message = stream.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        debug!(%user_id, error = %err, "relay: read failed");
                        break;
                    }
                    None => break,
                };
                last_seen = Instant::now();
                match message {
                    Message::Text(text) => match RelayFrame::parse(&text) {
                        Ok(RelayFrame::Response(response)) => hub.deliver(&user_id, response),
                        Ok(RelayFrame::Control(ControlFrame::Ping)) => {
                            if send_frame(&mut sink, &RelayFrame::from(ControlFrame::Pong)).await.is_err() {
                                break;
                            }
                        }
                        Ok(RelayFrame::Control(ControlFrame::Pong)) => {}
                        Ok(RelayFrame::Control(ControlFrame::AgentMetadata(metadata))) => {
                            hub.refresh_metadata(&user_id, ticket.id, metadata);
                        }
                        Ok(RelayFrame::Request(request)) => {
                            warn!(%user_id, id = %request.id, "relay: agents may not send requests");
                        }
                        Err(err) => warn!(%user_id, error = %err, "relay: unreadable frame"),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    hub.detach(&user_id, ticket.id);
}

/// Agents announce before sending anything else; earlier frames are skipped.
async fn await_metadata(stream: &mut SplitStream<WebSocket>) -> Option<AgentMetadata> {
    while let Some(message) = stream.next().await {
        match message.ok()? {
            Message::Text(text) => match RelayFrame::parse(&text) {
                Ok(RelayFrame::Control(ControlFrame::AgentMetadata(metadata))) => {
                    return Some(metadata)
                }
                Ok(other) => debug!(frame = ?other, "relay: ignoring frame before metadata"),
                Err(err) => debug!(error = %err, "relay: unreadable frame before metadata"),
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn send_frame<S>(sink: &mut S, frame: &RelayFrame) -> anyhow::Result<()>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    sink.send(Message::Text(frame.to_text()?)).await?;
    Ok(())
}
