//! Correlation of relayed requests with the responses that come back on the
//! agent's socket.
//!
//! Every entry is removed exactly once: by the response that settles it, by
//! [`PendingRequests::reject_user`] when the socket goes away, or by the
//! [`PendingGuard`] when the waiting caller gives up (timeout or drop).

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tether_proto::{ErrorBody, RelayResponse};
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

pub const DEFAULT_MAX_PENDING: usize = 1024;

pub type Settlement = Result<Value, ErrorBody>;

#[derive(Debug, Error)]
#[error("too many relayed requests in flight (limit {0})")]
pub struct PendingFull(pub usize);

struct PendingEntry {
    user_id: String,
    tx: oneshot::Sender<Settlement>,
}

pub struct PendingRequests {
    entries: Mutex<HashMap<String, PendingEntry>>,
    limit: usize,
}

impl PendingRequests {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            limit: limit.max(1),
        })
    }

    /// Registers a new correlation id for `user_id`.
    pub fn register(
        self: &Arc<Self>,
        user_id: &str,
    ) -> Result<(PendingGuard, oneshot::Receiver<Settlement>), PendingFull> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.lock();
        if entries.len() >= self.limit {
            return Err(PendingFull(self.limit));
        }
        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        entries.insert(
            id.clone(),
            PendingEntry {
                user_id: user_id.to_string(),
                tx,
            },
        );
        drop(entries);
        Ok((
            PendingGuard {
                id,
                pending: Arc::clone(self),
            },
            rx,
        ))
    }

    /// Settles the entry named by the response. Returns false for ids that
    /// are no longer pending or belong to another user.
    pub fn resolve(&self, user_id: &str, response: RelayResponse) -> bool {
        let entry = {
            let mut entries = self.lock();
            match entries.get(&response.id) {
                Some(entry) if entry.user_id == user_id => entries.remove(&response.id),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return false;
        };
        // The waiter may have gone away between removal and send.
        let _ = entry.tx.send(response.into_result());
        true
    }

    /// Fails every entry owned by `user_id` with `error`.
    pub fn reject_user(&self, user_id: &str, error: &ErrorBody) -> usize {
        let rejected: Vec<PendingEntry> = {
            let mut entries = self.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.user_id == user_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        let count = rejected.len();
        for entry in rejected {
            let _ = entry.tx.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes its entry when dropped, whatever happened to the request.
pub struct PendingGuard {
    id: String,
    pending: Arc<PendingRequests>,
}

impl PendingGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}
