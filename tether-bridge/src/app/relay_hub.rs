use crate::app::pending::{PendingFull, PendingRequests};
use crate::app::registry::ConnectionRegistry;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tether_proto::{
    AgentMetadata, ErrorBody, ErrorCode, Operation, RelayFrame, RelayRequest, RelayResponse,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(30);
const SESSION_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no relay session for user {0}")]
    NotConnected(String),
    #[error("relay session for user {0} closed")]
    SessionClosed(String),
    #[error("relay request timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Busy(#[from] PendingFull),
    /// Structured failure: the agent's own answer, or the hub giving up on a
    /// lost session.
    #[error("{0}")]
    Remote(ErrorBody),
}

/// The outbound half of a registered socket. Dropping the hub's copy of the
/// sender ends the socket task.
pub struct SessionTicket {
    pub id: Uuid,
    pub outbound: mpsc::Receiver<RelayFrame>,
}

struct RelaySession {
    id: Uuid,
    tx: mpsc::Sender<RelayFrame>,
}

/// Per-user relay sessions plus the pending-request map.
pub struct RelayHub {
    sessions: RwLock<HashMap<String, RelaySession>>,
    pending: Arc<PendingRequests>,
    registry: Arc<ConnectionRegistry>,
}

impl RelayHub {
    pub fn new(registry: Arc<ConnectionRegistry>, max_pending: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            pending: PendingRequests::new(max_pending),
            registry,
        }
    }

    /// Registers the socket that just announced `metadata`. A previous
    /// session for the same user is replaced and its pending requests fail.
    pub fn attach(&self, user_id: &str, metadata: AgentMetadata) -> SessionTicket {
        let (tx, outbound) = mpsc::channel(SESSION_CAPACITY);
        let id = Uuid::new_v4();
        let previous = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), RelaySession { id, tx });
        if let Some(previous) = previous {
            warn!(user_id, replaced = %previous.id, session = %id, "relay: session replaced");
            self.reject_pending(user_id, "relay session was replaced");
        }
        self.registry.record_relay_open(user_id, metadata);
        info!(user_id, session = %id, "relay: session attached");
        SessionTicket { id, outbound }
    }

    /// Re-applies metadata announced on an already attached session.
    pub fn refresh_metadata(&self, user_id: &str, session_id: Uuid, metadata: AgentMetadata) {
        if self.session_id(user_id) == Some(session_id) {
            self.registry.record_relay_open(user_id, metadata);
        }
    }

    /// Ends `session_id` if it is still the user's current session.
    pub fn detach(&self, user_id: &str, session_id: Uuid) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            match sessions.get(user_id) {
                Some(session) if session.id == session_id => sessions.remove(user_id).is_some(),
                _ => false,
            }
        };
        if removed {
            self.registry.record_relay_closed(user_id);
            let rejected = self.reject_pending(user_id, "relay session closed");
            info!(user_id, session = %session_id, rejected, "relay: session detached");
        }
        removed
    }

    pub fn is_attached(&self, user_id: &str) -> bool {
        self.session_id(user_id).is_some()
    }

    /// Hands a response frame to whoever is waiting for it.
    pub fn deliver(&self, user_id: &str, response: RelayResponse) {
        let id = response.id.clone();
        if !self.pending.resolve(user_id, response) {
            debug!(user_id, %id, "relay: dropping response for unknown or expired request");
        }
    }

    /// Sends `operation` to the user's agent and waits up to `timeout` for
    /// the correlated response. The pending entry is gone when this returns.
    pub async fn round_trip(
        &self,
        user_id: &str,
        operation: Operation,
        timeout: Duration,
    ) -> Result<Value, RelayError> {
        let tx = self
            .sender(user_id)
            .ok_or_else(|| RelayError::NotConnected(user_id.to_string()))?;
        let (guard, rx) = self.pending.register(user_id)?;
        let frame = RelayFrame::from(RelayRequest {
            id: guard.id().to_string(),
            operation,
        });

        let exchange = async {
            tx.send(frame)
                .await
                .map_err(|_| RelayError::SessionClosed(user_id.to_string()))?;
            match rx.await {
                Ok(Ok(data)) => Ok(data),
                Ok(Err(error)) => Err(RelayError::Remote(error)),
                Err(_) => Err(RelayError::SessionClosed(user_id.to_string())),
            }
        };
        let outcome = tokio::time::timeout(timeout, exchange).await;
        drop(guard);
        match outcome {
            Ok(result) => result,
            Err(_) => {
                debug!(user_id, timeout_ms = timeout.as_millis() as u64, "relay: request timed out");
                Err(RelayError::Timeout(timeout))
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn sender(&self, user_id: &str) -> Option<mpsc::Sender<RelayFrame>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .map(|session| session.tx.clone())
    }

    fn session_id(&self, user_id: &str) -> Option<Uuid> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .map(|session| session.id)
    }

    fn reject_pending(&self, user_id: &str, message: &str) -> usize {
        let error = ErrorBody::new(ErrorCode::AgentUnavailable, message);
        self.pending.reject_user(user_id, &error)
    }
}
