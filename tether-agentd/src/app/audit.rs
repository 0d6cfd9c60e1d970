use crate::domain::audit::{AuditEntry, AuditRecord};
use crate::telemetry::AgentMetrics;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

/// Bounded, append-only record of every attempted operation.
///
/// Appends are serialized by one mutex, so sequence numbers and timestamps
/// are assigned in the order entries become visible.
pub struct AuditLog {
    capacity: usize,
    state: Mutex<AuditState>,
    metrics: Option<Arc<AgentMetrics>>,
}

#[derive(Default)]
struct AuditState {
    entries: VecDeque<AuditEntry>,
    next_sequence: u64,
}

impl AuditLog {
    pub fn new(capacity: usize, metrics: Option<Arc<AgentMetrics>>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(AuditState {
                entries: VecDeque::with_capacity(capacity),
                next_sequence: 1,
            }),
            metrics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(&self, record: AuditRecord) -> AuditEntry {
        let (entry, evicted) = {
            let mut state = self.lock();
            let entry = AuditEntry {
                sequence: state.next_sequence,
                timestamp: Utc::now(),
                operation: record.operation,
                target: record.target,
                outcome: record.outcome,
                reason: record.reason,
                origin: record.origin,
            };
            state.next_sequence += 1;
            let evicted = if state.entries.len() == self.capacity {
                state.entries.pop_front().is_some()
            } else {
                false
            };
            state.entries.push_back(entry.clone());
            (entry, evicted)
        };

        if evicted {
            if let Some(metrics) = &self.metrics {
                metrics.record_audit_eviction();
            }
        }
        info!(
            target: "tether::audit",
            sequence = entry.sequence,
            operation = %entry.operation,
            target_path = %entry.target,
            outcome = %entry.outcome,
            reason = entry.reason.as_deref().unwrap_or(""),
            origin = %entry.origin,
            "audit"
        );
        entry
    }

    /// Newest `limit` entries (all when `None`), oldest first.
    pub fn tail(&self, limit: Option<usize>) -> Vec<AuditEntry> {
        let state = self.lock();
        let skip = limit.map_or(0, |limit| state.entries.len().saturating_sub(limit));
        state.entries.iter().skip(skip).cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AuditState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audit::{AuditOutcome, Origin};
    use proptest::prelude::*;

    fn record(n: usize) -> AuditRecord {
        AuditRecord::new("fs.read", format!("/tmp/{n}"), AuditOutcome::Success, Origin::Http)
    }

    #[test]
    fn tail_returns_newest_in_order() {
        let log = AuditLog::new(10, None);
        for n in 0..5 {
            log.append(record(n));
        }
        let tail = log.tail(Some(2));
        let targets: Vec<_> = tail.iter().map(|e| e.target.as_str()).collect();
        assert_eq!(targets, ["/tmp/3", "/tmp/4"]);
        assert_eq!(log.tail(None).len(), 5);
        assert_eq!(log.tail(Some(50)).len(), 5);
    }

    #[test]
    fn oldest_entry_is_evicted_first() {
        let log = AuditLog::new(3, None);
        for n in 0..4 {
            log.append(record(n));
        }
        let entries = log.tail(None);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].target, "/tmp/1");
        assert_eq!(entries[0].sequence, 2);
    }

    #[test]
    fn denied_entries_keep_their_reason() {
        let log = AuditLog::default();
        let entry = log.append(
            AuditRecord::new("fs.write", "/etc/hosts", AuditOutcome::Denied, Origin::Relay)
                .with_reason("safe-mode-readonly"),
        );
        assert_eq!(entry.reason.as_deref(), Some("safe-mode-readonly"));
        assert_eq!(log.tail(None)[0], entry);
    }

    #[test]
    fn concurrent_appends_get_unique_sequences() {
        let log = Arc::new(AuditLog::new(1000, None));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for n in 0..50 {
                        log.append(record(t * 100 + n));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let sequences: Vec<u64> = log.tail(None).iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=400).collect::<Vec<_>>());
    }

    proptest! {
        #[test]
        fn never_exceeds_capacity(capacity in 1usize..50, appends in 0usize..200) {
            let log = AuditLog::new(capacity, None);
            for n in 0..appends {
                log.append(record(n));
                prop_assert!(log.len() <= capacity);
            }
            let entries = log.tail(None);
            prop_assert_eq!(entries.len(), appends.min(capacity));
            if let Some(last) = entries.last() {
                prop_assert_eq!(last.sequence, appends as u64);
            }
            prop_assert!(entries.windows(2).all(|w| w[0].sequence + 1 == w[1].sequence));
        }
    }
}
