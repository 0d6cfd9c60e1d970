use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tether_proto::{GrantView, OperationKind, PermissionMode};

/// The single live permission grant of an agent session.
///
/// Directories are stored canonicalized; checks compare canonical paths
/// component-wise, so `/home/alice/pr` never covers `/home/alice/proj`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    mode: PermissionMode,
    allowed_directories: BTreeSet<PathBuf>,
    allowed_operations: BTreeSet<OperationKind>,
    approved_at: Option<DateTime<Utc>>,
    revision: u64,
}

impl SessionGrant {
    /// Grant in effect at boot: safe mode, nothing approved.
    pub fn boot() -> Self {
        Self {
            mode: PermissionMode::Safe,
            allowed_directories: BTreeSet::new(),
            allowed_operations: BTreeSet::new(),
            approved_at: None,
            revision: 0,
        }
    }

    pub fn approved(
        mode: PermissionMode,
        allowed_directories: impl IntoIterator<Item = PathBuf>,
        allowed_operations: impl IntoIterator<Item = OperationKind>,
        revision: u64,
    ) -> Self {
        Self {
            mode,
            allowed_directories: allowed_directories.into_iter().collect(),
            allowed_operations: allowed_operations.into_iter().collect(),
            approved_at: Some(Utc::now()),
            revision,
        }
    }

    pub fn mode(&self) -> PermissionMode {
        self.mode
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn allowed_directories(&self) -> &BTreeSet<PathBuf> {
        &self.allowed_directories
    }

    pub fn allowed_operations(&self) -> &BTreeSet<OperationKind> {
        &self.allowed_operations
    }

    pub fn allows_kind(&self, kind: OperationKind) -> bool {
        self.allowed_operations.contains(&kind)
    }

    /// True when `canonical` equals or descends from an allowed directory.
    pub fn covers(&self, canonical: &Path) -> bool {
        self.allowed_directories
            .iter()
            .any(|dir| canonical.starts_with(dir))
    }

    pub fn view(&self) -> GrantView {
        GrantView {
            mode: self.mode,
            allowed_directories: self.allowed_directories.iter().cloned().collect(),
            allowed_operations: self.allowed_operations.iter().copied().collect(),
            revision: self.revision,
            approved_at: self.approved_at,
        }
    }
}

impl Default for SessionGrant {
    fn default() -> Self {
        Self::boot()
    }
}

/// Copy-on-replace holder for the live grant.
///
/// Readers clone the `Arc` and evaluate against that snapshot; an approval
/// swaps in a fresh grant under one write lock, so no reader ever observes
/// fields from two different grants.
#[derive(Debug, Default)]
pub struct GrantStore {
    current: RwLock<Arc<SessionGrant>>,
}

impl GrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<SessionGrant> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Builds the next grant from the next revision number and installs it.
    pub fn replace<F>(&self, build: F) -> Arc<SessionGrant>
    where
        F: FnOnce(u64) -> SessionGrant,
    {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let next = Arc::new(build(guard.revision + 1));
        *guard = next.clone();
        next
    }
}
