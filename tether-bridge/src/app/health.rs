use crate::app::registry::ConnectionRegistry;
use crate::domain::connection::ConnectionStatus;
use crate::ports::agent_http::AgentHttp;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

/// Shorter than the status TTL so a live agent never drops out of `full`.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(2);
/// How long a user with a closed relay and no healthy probe is remembered.
pub const DEFAULT_RECORD_RETENTION: Duration = Duration::from_secs(10 * 60);
const CHANNEL_CAPACITY: usize = 4;

/// Probes announced agent ports and writes the results to the registry.
pub struct HealthMonitor {
    registry: Arc<ConnectionRegistry>,
    client: Arc<dyn AgentHttp>,
    retention: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<ConnectionRegistry>, client: Arc<dyn AgentHttp>) -> Self {
        Self {
            registry,
            client,
            retention: DEFAULT_RECORD_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// One background pass: forget abandoned agents, then probe the rest.
    pub async fn sweep(&self) -> usize {
        let forgotten = self.registry.prune_abandoned(self.retention);
        if !forgotten.is_empty() {
            debug!(forgotten = forgotten.len(), "pruned abandoned connection records");
        }
        self.probe_all().await
    }

    pub async fn probe_user(&self, user_id: &str, port: u16) -> bool {
        let healthy = self.client.probe(port).await;
        self.registry.record_health_probe(user_id, healthy);
        healthy
    }

    /// Probes every known port concurrently; returns how many were healthy.
    pub async fn probe_all(&self) -> usize {
        let targets = self.registry.users_with_port();
        let probes = targets
            .iter()
            .map(|(user_id, port)| self.probe_user(user_id, *port));
        let healthy = join_all(probes)
            .await
            .into_iter()
            .filter(|healthy| *healthy)
            .count();
        debug!(targets = targets.len(), healthy, "health sweep completed");
        healthy
    }

    /// Probes on demand when the cached observation is older than the TTL.
    pub async fn refresh_if_stale(&self, user_id: &str) -> ConnectionStatus {
        if self.registry.probe_is_stale(user_id) {
            if let Some(port) = self.registry.http_port(user_id) {
                self.probe_user(user_id, port).await;
            }
        }
        self.registry.status(user_id)
    }
}

enum MonitorCommand {
    Shutdown,
}

#[derive(Clone)]
pub struct HealthMonitorHandle {
    tx: mpsc::Sender<MonitorCommand>,
}

impl HealthMonitorHandle {
    pub async fn shutdown(&self) {
        let _ = self.tx.send(MonitorCommand::Shutdown).await;
    }
}

pub fn spawn_health_monitor(monitor: Arc<HealthMonitor>, interval: Duration) -> HealthMonitorHandle {
    let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                command = rx.recv() => match command {
                    Some(MonitorCommand::Shutdown) | None => {
                        info!("health monitor stopped");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    monitor.sweep().await;
                }
            }
        }
    });
    HealthMonitorHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::agent_http::DirectCallError;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tether_proto::{AgentMetadata, Operation};

    #[derive(Default)]
    struct ScriptedAgent {
        down: AtomicBool,
        probes: AtomicUsize,
    }

    #[async_trait]
    impl AgentHttp for ScriptedAgent {
        async fn probe(&self, _port: u16) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            !self.down.load(Ordering::SeqCst)
        }

        async fn call(
            &self,
            _port: u16,
            _secret: &str,
            _operation: &Operation,
            _timeout: Duration,
        ) -> Result<Value, DirectCallError> {
            Ok(Value::Null)
        }
    }

    fn setup() -> (Arc<ConnectionRegistry>, Arc<ScriptedAgent>, HealthMonitor) {
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(5)));
        registry.record_relay_open(
            "alice",
            AgentMetadata {
                home_directory: "/home/alice".into(),
                platform: "linux".into(),
                http_port: Some(7717),
            },
        );
        let agent = Arc::new(ScriptedAgent::default());
        let monitor = HealthMonitor::new(registry.clone(), agent.clone());
        (registry, agent, monitor)
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_only_probes_when_stale() {
        let (_registry, agent, monitor) = setup();
        assert_eq!(monitor.refresh_if_stale("alice").await, ConnectionStatus::Full);
        assert_eq!(monitor.refresh_if_stale("alice").await, ConnectionStatus::Full);
        assert_eq!(agent.probes.load(Ordering::SeqCst), 1);

        time::advance(Duration::from_secs(6)).await;
        agent.down.store(true, Ordering::SeqCst);
        assert_eq!(
            monitor.refresh_if_stale("alice").await,
            ConnectionStatus::RelayOnly
        );
        assert_eq!(agent.probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_notices_a_dead_agent() {
        let (registry, agent, monitor) = setup();
        let handle = spawn_health_monitor(Arc::new(monitor), Duration::from_secs(2));

        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.status("alice"), ConnectionStatus::Full);

        agent.down.store(true, Ordering::SeqCst);
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(registry.status("alice"), ConnectionStatus::RelayOnly);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_stop_probing_agents_that_left() {
        let (registry, agent, monitor) = setup();
        let monitor = monitor.with_retention(Duration::from_secs(30));
        agent.down.store(true, Ordering::SeqCst);
        registry.record_relay_closed("alice");

        monitor.sweep().await;
        assert_eq!(agent.probes.load(Ordering::SeqCst), 1);

        time::advance(Duration::from_secs(31)).await;
        assert_eq!(monitor.sweep().await, 0);
        assert!(registry.is_empty());
        assert_eq!(agent.probes.load(Ordering::SeqCst), 1);
    }
}
