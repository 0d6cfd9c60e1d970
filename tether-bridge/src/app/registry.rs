use crate::domain::connection::{
    derive_status, ConnectionRecord, ConnectionStatus, ProbeObservation, RelaySocketState,
    DEFAULT_STATUS_TTL,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tether_proto::AgentMetadata;
use tokio::time::Instant;
use tracing::{debug, info};

/// Connection records for every user whose agent has announced itself.
/// Shared by reference; there is no process-wide instance.
pub struct ConnectionRegistry {
    ttl: Duration,
    records: RwLock<HashMap<String, ConnectionRecord>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeView {
    pub at: DateTime<Utc>,
    pub healthy: bool,
    pub age_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub user_id: String,
    pub status: ConnectionStatus,
    pub http_port: Option<u16>,
    pub relay: RelaySocketState,
    pub last_metadata_at: Option<DateTime<Utc>>,
    pub last_probe: Option<ProbeView>,
    pub platform: Option<String>,
    pub home_directory: Option<PathBuf>,
}

impl ConnectionSnapshot {
    fn unknown(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            status: ConnectionStatus::None,
            http_port: None,
            relay: RelaySocketState::Closed,
            last_metadata_at: None,
            last_probe: None,
            platform: None,
            home_directory: None,
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_TTL)
    }
}

impl ConnectionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn record_relay_open(&self, user_id: &str, metadata: AgentMetadata) {
        let mut records = self.write();
        match records.get_mut(user_id) {
            Some(record) => record.reannounce(metadata),
            None => {
                records.insert(user_id.to_string(), ConnectionRecord::announced(metadata));
            }
        }
    }

    pub fn record_relay_closed(&self, user_id: &str) {
        if let Some(record) = self.write().get_mut(user_id) {
            record.relay_closed();
        }
    }

    /// Stores a probe result. Returns false when the user is unknown.
    pub fn record_health_probe(&self, user_id: &str, healthy: bool) -> bool {
        match self.write().get_mut(user_id) {
            Some(record) => {
                record.observe(ProbeObservation::now(healthy));
                true
            }
            None => {
                debug!(user_id, healthy, "ignoring probe for unknown user");
                false
            }
        }
    }

    pub fn status(&self, user_id: &str) -> ConnectionStatus {
        self.read()
            .get(user_id)
            .map(|record| derive_status(record, Instant::now(), self.ttl))
            .unwrap_or(ConnectionStatus::None)
    }

    pub fn http_port(&self, user_id: &str) -> Option<u16> {
        self.read().get(user_id).and_then(|record| record.http_port)
    }

    /// True when the user has a port and no probe newer than the TTL.
    pub fn probe_is_stale(&self, user_id: &str) -> bool {
        let now = Instant::now();
        self.read().get(user_id).is_some_and(|record| {
            record.http_port.is_some()
                && record
                    .last_probe
                    .as_ref()
                    .map_or(true, |probe| now.saturating_duration_since(probe.at) > self.ttl)
        })
    }

    pub fn snapshot(&self, user_id: &str) -> ConnectionSnapshot {
        let now = Instant::now();
        let records = self.read();
        let Some(record) = records.get(user_id) else {
            return ConnectionSnapshot::unknown(user_id);
        };
        ConnectionSnapshot {
            user_id: user_id.to_string(),
            status: derive_status(record, now, self.ttl),
            http_port: record.http_port,
            relay: record.relay_socket_state,
            last_metadata_at: Some(record.last_metadata_at),
            last_probe: record.last_probe.map(|probe| ProbeView {
                at: probe.observed_at,
                healthy: probe.healthy,
                age_ms: now.saturating_duration_since(probe.at).as_millis() as u64,
            }),
            platform: Some(record.metadata.platform.clone()),
            home_directory: Some(record.metadata.home_directory.clone()),
        }
    }

    /// Users the health monitor should probe.
    pub fn users_with_port(&self) -> Vec<(String, u16)> {
        self.read()
            .iter()
            .filter_map(|(user, record)| record.http_port.map(|port| (user.clone(), port)))
            .collect()
    }

    /// Forgets users whose relay is closed and whose agent has not been
    /// seen for longer than `retention`. Returns the removed user ids.
    pub fn prune_abandoned(&self, retention: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut records = self.write();
        let abandoned: Vec<String> = records
            .iter()
            .filter(|(_, record)| record.is_abandoned(now, retention))
            .map(|(user, _)| user.clone())
            .collect();
        for user_id in &abandoned {
            records.remove(user_id);
            info!(user_id, "forgetting abandoned agent");
        }
        abandoned
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ConnectionRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ConnectionRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn metadata(port: Option<u16>) -> AgentMetadata {
        AgentMetadata {
            home_directory: "/home/alice".into(),
            platform: "linux".into(),
            http_port: port,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn status_follows_probes_and_socket() {
        let registry = ConnectionRegistry::default();
        assert_eq!(registry.status("alice"), ConnectionStatus::None);

        registry.record_relay_open("alice", metadata(Some(7717)));
        assert_eq!(registry.status("alice"), ConnectionStatus::RelayOnly);

        assert!(registry.record_health_probe("alice", true));
        assert_eq!(registry.status("alice"), ConnectionStatus::Full);

        registry.record_relay_closed("alice");
        assert_eq!(registry.status("alice"), ConnectionStatus::HttpOnly);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_agent_leaves_full_within_one_ttl() {
        let registry = ConnectionRegistry::new(Duration::from_secs(5));
        registry.record_relay_open("alice", metadata(Some(7717)));
        registry.record_health_probe("alice", true);
        assert_eq!(registry.status("alice"), ConnectionStatus::Full);
        assert!(!registry.probe_is_stale("alice"));

        advance(Duration::from_secs(5) + Duration::from_millis(1)).await;
        assert_eq!(registry.status("alice"), ConnectionStatus::RelayOnly);
        assert!(registry.probe_is_stale("alice"));

        registry.record_relay_closed("alice");
        assert_eq!(registry.status("alice"), ConnectionStatus::None);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_demotes_immediately() {
        let registry = ConnectionRegistry::default();
        registry.record_relay_open("alice", metadata(Some(7717)));
        registry.record_health_probe("alice", true);
        registry.record_health_probe("alice", false);
        assert_eq!(registry.status("alice"), ConnectionStatus::RelayOnly);
    }

    #[tokio::test(start_paused = true)]
    async fn agents_gone_past_retention_are_forgotten() {
        let registry = ConnectionRegistry::default();
        let retention = Duration::from_secs(600);
        registry.record_relay_open("alice", metadata(Some(7717)));
        registry.record_relay_open("bob", metadata(Some(7718)));
        registry.record_relay_closed("alice");
        registry.record_relay_closed("bob");

        advance(Duration::from_secs(300)).await;
        registry.record_health_probe("bob", true);
        advance(Duration::from_secs(301)).await;

        assert_eq!(registry.prune_abandoned(retention), vec!["alice".to_string()]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.users_with_port(), vec![("bob".to_string(), 7718)]);
        assert_eq!(registry.snapshot("alice").status, ConnectionStatus::None);
    }

    #[test]
    fn probes_for_unknown_users_are_ignored() {
        let registry = ConnectionRegistry::default();
        assert!(!registry.record_health_probe("ghost", true));
        assert_eq!(registry.status("ghost"), ConnectionStatus::None);
        assert!(registry.users_with_port().is_empty());
    }

    #[tokio::test]
    async fn snapshot_reports_wire_shape() {
        let registry = ConnectionRegistry::default();
        registry.record_relay_open("alice", metadata(Some(7717)));
        registry.record_health_probe("alice", true);

        let value = serde_json::to_value(registry.snapshot("alice")).unwrap();
        assert_eq!(value["status"], "full");
        assert_eq!(value["httpPort"], 7717);
        assert_eq!(value["relay"], "open");
        assert_eq!(value["lastProbe"]["healthy"], true);
        assert!(value["lastMetadataAt"].is_string());

        let unknown = serde_json::to_value(registry.snapshot("bob")).unwrap();
        assert_eq!(unknown["status"], "none");
        assert!(unknown["lastProbe"].is_null());
        assert_eq!(registry.users_with_port(), vec![("alice".to_string(), 7717)]);
    }
}
