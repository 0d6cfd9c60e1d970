use crate::domain::grant::{GrantStore, SessionGrant};
use crate::ports::canonicalizer::{CanonicalizeError, PathCanonicalizer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether_proto::{Operation, OperationKind, PermissionMode, PlanApproval};
use tracing::{debug, info, warn};

/// Why an operation was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    SafeModeReadonly,
    OperationNotAllowed(OperationKind),
    OutsideAllowedDirectories(PathBuf),
    PathUnresolvable(PathBuf),
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::SafeModeReadonly => "safe-mode-readonly",
            DenyReason::OperationNotAllowed(_) => "operation-not-allowed",
            DenyReason::OutsideAllowedDirectories(_) => "outside-allowed-directories",
            DenyReason::PathUnresolvable(_) => "path-unresolvable",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::SafeModeReadonly => {
                write!(f, "safe mode only permits reads inside the home directory")
            }
            DenyReason::OperationNotAllowed(kind) => {
                write!(f, "{kind} operations are not in the approved plan")
            }
            DenyReason::OutsideAllowedDirectories(path) => {
                write!(f, "{} is outside the approved directories", path.display())
            }
            DenyReason::PathUnresolvable(path) => {
                write!(f, "cannot resolve {}", path.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(DenyReason),
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

/// One `(kind, path)` pair an operation needs permission for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access<'a> {
    pub kind: OperationKind,
    pub path: &'a Path,
}

impl<'a> Access<'a> {
    fn new(kind: OperationKind, path: &'a Path) -> Self {
        Self { kind, path }
    }
}

pub fn required_accesses(operation: &Operation) -> Vec<Access<'_>> {
    use OperationKind::*;
    match operation {
        Operation::List(args) => vec![Access::new(Read, &args.path)],
        Operation::Read(args) => vec![Access::new(Read, &args.path)],
        Operation::Write(args) => vec![Access::new(Write, &args.path)],
        Operation::Create(args) => vec![Access::new(Write, &args.path)],
        Operation::Delete(args) => vec![Access::new(Delete, &args.path)],
        Operation::Move(args) => vec![
            Access::new(Delete, &args.from),
            Access::new(Write, &args.to),
        ],
        Operation::Copy(args) => vec![Access::new(Read, &args.from), Access::new(Write, &args.to)],
        // An exec without a cwd has not been anchored yet; the empty path
        // cannot be resolved and is denied.
        Operation::Exec(args) => vec![Access::new(
            Execute,
            args.cwd.as_deref().unwrap_or(Path::new("")),
        )],
    }
}

/// Filesystem context a decision is taken in.
#[derive(Clone, Copy)]
pub struct PathScope<'a> {
    /// Canonical home directory; the only place safe mode reads from.
    pub safe_root: &'a Path,
    pub canonicalizer: &'a dyn PathCanonicalizer,
}

/// Decides whether `operation` may run under `grant`. Reads nothing but its
/// arguments and, through the canonicalizer, the filesystem.
pub fn check_permission(
    grant: &SessionGrant,
    operation: &Operation,
    scope: &PathScope<'_>,
) -> PolicyDecision {
    let accesses = required_accesses(operation);
    match grant.mode() {
        PermissionMode::Unrestricted => PolicyDecision::Allow,
        PermissionMode::Safe => {
            for access in &accesses {
                if access.kind != OperationKind::Read {
                    return PolicyDecision::Deny(DenyReason::SafeModeReadonly);
                }
                match scope.canonicalizer.canonicalize(access.path) {
                    Ok(canonical) if canonical.starts_with(scope.safe_root) => {}
                    Ok(_) => return PolicyDecision::Deny(DenyReason::SafeModeReadonly),
                    Err(_) => {
                        return PolicyDecision::Deny(DenyReason::PathUnresolvable(
                            access.path.to_path_buf(),
                        ))
                    }
                }
            }
            PolicyDecision::Allow
        }
        PermissionMode::Balanced => {
            for access in &accesses {
                if !grant.allows_kind(access.kind) {
                    return PolicyDecision::Deny(DenyReason::OperationNotAllowed(access.kind));
                }
                let canonical = match scope.canonicalizer.canonicalize(access.path) {
                    Ok(canonical) => canonical,
                    Err(_) => {
                        return PolicyDecision::Deny(DenyReason::PathUnresolvable(
                            access.path.to_path_buf(),
                        ))
                    }
                };
                if !grant.covers(&canonical) {
                    return PolicyDecision::Deny(DenyReason::OutsideAllowedDirectories(canonical));
                }
            }
            PolicyDecision::Allow
        }
    }
}

/// Resolves `~` and relative paths against the home directory.
pub fn anchor_path(path: &Path, home: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        return home.join(rest);
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        home.join(path)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ApprovalError {
    #[error("cannot approve directory {path}: {source}")]
    Unresolvable {
        path: PathBuf,
        #[source]
        source: CanonicalizeError,
    },
}

/// Owns the live grant and evaluates operations against it.
pub struct PolicyEngine {
    grants: GrantStore,
    safe_root: PathBuf,
    canonicalizer: Arc<dyn PathCanonicalizer>,
}

impl PolicyEngine {
    pub fn new(home: &Path, canonicalizer: Arc<dyn PathCanonicalizer>) -> Self {
        let safe_root = match canonicalizer.canonicalize(home) {
            Ok(root) => root,
            Err(err) => {
                warn!(home = %home.display(), %err, "home directory does not canonicalize; using it verbatim");
                home.to_path_buf()
            }
        };
        info!(safe_root = %safe_root.display(), "policy engine booted in safe mode");
        Self {
            grants: GrantStore::new(),
            safe_root,
            canonicalizer,
        }
    }

    pub fn grant(&self) -> Arc<SessionGrant> {
        self.grants.snapshot()
    }

    pub fn safe_root(&self) -> &Path {
        &self.safe_root
    }

    pub fn evaluate(&self, operation: &Operation) -> PolicyDecision {
        let grant = self.grants.snapshot();
        let decision = check_permission(
            &grant,
            operation,
            &PathScope {
                safe_root: &self.safe_root,
                canonicalizer: self.canonicalizer.as_ref(),
            },
        );
        debug!(
            operation = operation.name(),
            mode = %grant.mode(),
            revision = grant.revision(),
            allowed = decision.is_allowed(),
            "policy evaluated"
        );
        decision
    }

    /// Replaces the live grant. Every directory is canonicalized before the
    /// swap; one failure rejects the approval and keeps the previous grant.
    pub fn approve_plan(&self, approval: &PlanApproval) -> Result<Arc<SessionGrant>, ApprovalError> {
        let mut directories = Vec::with_capacity(approval.allowed_directories.len());
        for dir in &approval.allowed_directories {
            let anchored = anchor_path(dir, &self.safe_root);
            let canonical = self
                .canonicalizer
                .canonicalize(&anchored)
                .map_err(|source| ApprovalError::Unresolvable {
                    path: dir.clone(),
                    source,
                })?;
            directories.push(canonical);
        }
        let operations = approval.allowed_operations.iter().copied();
        let grant = self.grants.replace(|revision| {
            SessionGrant::approved(approval.mode, directories, operations, revision)
        });
        info!(
            mode = %grant.mode(),
            revision = grant.revision(),
            directories = grant.allowed_directories().len(),
            "plan approved"
        );
        Ok(grant)
    }
}
