use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tether_proto::AgentMetadata;
use tokio::time::Instant;

/// How long a successful health probe vouches for the direct path.
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(5);

/// Reachability of one user's agent, derived on every read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    None,
    HttpOnly,
    RelayOnly,
    Full,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::None => "none",
            ConnectionStatus::HttpOnly => "http-only",
            ConnectionStatus::RelayOnly => "relay-only",
            ConnectionStatus::Full => "full",
        }
    }

    pub fn has_direct(&self) -> bool {
        matches!(self, ConnectionStatus::HttpOnly | ConnectionStatus::Full)
    }

    pub fn has_relay(&self) -> bool {
        matches!(self, ConnectionStatus::RelayOnly | ConnectionStatus::Full)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelaySocketState {
    Open,
    Closed,
}

/// Result of one direct `GET /health` against the agent.
#[derive(Clone, Copy, Debug)]
pub struct ProbeObservation {
    /// Monotonic time used for TTL arithmetic.
    pub at: Instant,
    /// Wall-clock time reported to operators.
    pub observed_at: DateTime<Utc>,
    pub healthy: bool,
}

impl ProbeObservation {
    pub fn now(healthy: bool) -> Self {
        Self {
            at: Instant::now(),
            observed_at: Utc::now(),
            healthy,
        }
    }

    fn vouches_at(&self, now: Instant, ttl: Duration) -> bool {
        self.healthy && now.saturating_duration_since(self.at) <= ttl
    }
}

/// What the bridge knows about one user's agent. Created by the first
/// metadata announcement over the relay.
#[derive(Clone, Debug)]
pub struct ConnectionRecord {
    pub metadata: AgentMetadata,
    pub http_port: Option<u16>,
    pub relay_socket_state: RelaySocketState,
    pub last_metadata_at: DateTime<Utc>,
    pub last_probe: Option<ProbeObservation>,
    pub http_last_healthy: Option<Instant>,
    /// Last evidence the agent was alive: an announcement, an open socket
    /// closing, or a healthy probe.
    pub last_seen: Instant,
}

impl ConnectionRecord {
    pub fn announced(metadata: AgentMetadata) -> Self {
        Self {
            http_port: metadata.http_port,
            metadata,
            relay_socket_state: RelaySocketState::Open,
            last_metadata_at: Utc::now(),
            last_probe: None,
            http_last_healthy: None,
            last_seen: Instant::now(),
        }
    }

    /// Applies a fresh announcement. A port change invalidates probes taken
    /// against the previous port.
    pub fn reannounce(&mut self, metadata: AgentMetadata) {
        if metadata.http_port != self.http_port {
            self.last_probe = None;
            self.http_last_healthy = None;
        }
        self.http_port = metadata.http_port;
        self.metadata = metadata;
        self.relay_socket_state = RelaySocketState::Open;
        self.last_metadata_at = Utc::now();
        self.last_seen = Instant::now();
    }

    pub fn relay_closed(&mut self) {
        self.relay_socket_state = RelaySocketState::Closed;
        self.last_seen = Instant::now();
    }

    pub fn observe(&mut self, probe: ProbeObservation) {
        if probe.healthy {
            self.http_last_healthy = Some(probe.at);
            self.last_seen = self.last_seen.max(probe.at);
        }
        self.last_probe = Some(probe);
    }

    /// True once the relay is closed and nothing has vouched for the agent
    /// for longer than `retention`.
    pub fn is_abandoned(&self, now: Instant, retention: Duration) -> bool {
        self.relay_socket_state == RelaySocketState::Closed
            && now.saturating_duration_since(self.last_seen) > retention
    }
}

/// Pure status derivation. `full` and `http-only` need a port and a healthy
/// probe no older than `ttl`; the relay half comes from the socket state.
pub fn derive_status(record: &ConnectionRecord, now: Instant, ttl: Duration) -> ConnectionStatus {
    let direct = record.http_port.is_some()
        && record
            .last_probe
            .as_ref()
            .is_some_and(|probe| probe.vouches_at(now, ttl));
    let relay = record.relay_socket_state == RelaySocketState::Open;
    match (relay, direct) {
        (true, true) => ConnectionStatus::Full,
        (false, true) => ConnectionStatus::HttpOnly,
        (true, false) => ConnectionStatus::RelayOnly,
        (false, false) => ConnectionStatus::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(port: Option<u16>) -> AgentMetadata {
        AgentMetadata {
            home_directory: "/home/alice".into(),
            platform: "linux".into(),
            http_port: port,
        }
    }

    fn probe(at: Instant, healthy: bool) -> ProbeObservation {
        ProbeObservation {
            at,
            observed_at: Utc::now(),
            healthy,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn derivation_table() {
        let now = Instant::now();
        let ttl = DEFAULT_STATUS_TTL;
        let mut record = ConnectionRecord::announced(metadata(Some(7717)));
        assert_eq!(derive_status(&record, now, ttl), ConnectionStatus::RelayOnly);

        record.observe(probe(now, true));
        assert_eq!(derive_status(&record, now, ttl), ConnectionStatus::Full);

        record.relay_socket_state = RelaySocketState::Closed;
        assert_eq!(derive_status(&record, now, ttl), ConnectionStatus::HttpOnly);

        record.observe(probe(now, false));
        assert_eq!(derive_status(&record, now, ttl), ConnectionStatus::None);
        assert_eq!(record.http_last_healthy, Some(now));
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_probe_expires_after_ttl() {
        let start = Instant::now();
        let ttl = Duration::from_secs(5);
        let mut record = ConnectionRecord::announced(metadata(Some(7717)));
        record.observe(probe(start, true));

        assert_eq!(
            derive_status(&record, start + ttl, ttl),
            ConnectionStatus::Full
        );
        assert_eq!(
            derive_status(&record, start + ttl + Duration::from_millis(1), ttl),
            ConnectionStatus::RelayOnly
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_port_means_no_direct_path() {
        let now = Instant::now();
        let mut record = ConnectionRecord::announced(metadata(None));
        record.observe(probe(now, true));
        assert_eq!(
            derive_status(&record, now, DEFAULT_STATUS_TTL),
            ConnectionStatus::RelayOnly
        );
    }

    #[tokio::test(start_paused = true)]
    async fn port_change_discards_old_probes() {
        let now = Instant::now();
        let mut record = ConnectionRecord::announced(metadata(Some(7717)));
        record.observe(probe(now, true));

        record.reannounce(metadata(Some(7718)));
        assert!(record.last_probe.is_none());
        assert_eq!(
            derive_status(&record, now, DEFAULT_STATUS_TTL),
            ConnectionStatus::RelayOnly
        );

        record.observe(probe(now, true));
        record.reannounce(metadata(Some(7718)));
        assert!(record.last_probe.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn only_closed_silent_records_are_abandoned() {
        let retention = Duration::from_secs(60);
        let mut record = ConnectionRecord::announced(metadata(Some(7717)));
        let later = Instant::now() + retention * 2;
        assert!(!record.is_abandoned(later, retention));

        record.relay_closed();
        assert!(record.is_abandoned(later, retention));

        record.observe(probe(later, true));
        assert!(!record.is_abandoned(later + retention, retention));
        assert!(record.is_abandoned(later + retention * 2, retention));
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(
            serde_json::to_value(ConnectionStatus::HttpOnly).unwrap(),
            "http-only"
        );
        assert!(ConnectionStatus::Full.has_direct());
        assert!(!ConnectionStatus::RelayOnly.has_direct());
        assert!(ConnectionStatus::RelayOnly.has_relay());
    }
}
