use crate::app::audit::AuditLog;
use crate::app::kill_switch::KillSwitch;
use crate::domain::audit::{AuditEntry, AuditOutcome, AuditRecord, Origin};
use crate::domain::grant::SessionGrant;
use crate::domain::output::OperationOutput;
use crate::policy_engine::{anchor_path, DenyReason, PolicyDecision, PolicyEngine};
use crate::ports::executor::{ExecutorError, OperationExecutor};
use crate::telemetry::AgentMetrics;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_proto::{ErrorBody, ErrorCode, GrantView, Operation, PlanApproval};
use tracing::{info, warn};

#[derive(thiserror::Error, Debug)]
pub enum OperationError {
    #[error("permission denied: {reason}")]
    PermissionDenied { reason: DenyReason },
    #[error("agent is shutting down")]
    ShuttingDown,
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("execution failed: {0}")]
    Failed(String),
}

pub type OperationResult<T> = Result<T, OperationError>;

/// Audit target for requests whose arguments never decoded.
const UNDECODED_TARGET: &str = "-";

impl OperationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OperationError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            OperationError::ShuttingDown => ErrorCode::ShuttingDown,
            OperationError::Invalid(_) => ErrorCode::InvalidRequest,
            OperationError::NotFound(_) => ErrorCode::NotFound,
            OperationError::Timeout(_) => ErrorCode::Timeout,
            OperationError::Failed(_) => ErrorCode::ExecutionFailed,
        }
    }

    /// Short machine-readable cause recorded in the audit log and error body.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            OperationError::PermissionDenied { reason } => Some(reason.code()),
            OperationError::ShuttingDown => Some("shutting-down"),
            _ => None,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let body = ErrorBody::new(self.code(), self.to_string());
        match self.reason() {
            Some(reason) => body.with_reason(reason),
            None => body,
        }
    }
}

impl From<ExecutorError> for OperationError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::NotFound(path) => OperationError::NotFound(path),
            ExecutorError::Invalid(message) => OperationError::Invalid(message),
            ExecutorError::Timeout(after) => OperationError::Timeout(after),
            ExecutorError::Failed(message) => OperationError::Failed(message),
        }
    }
}

/// Entry point shared by every transport that can carry an operation.
#[async_trait]
pub trait OperationPort: Send + Sync {
    async fn perform(&self, origin: Origin, operation: Operation) -> OperationResult<OperationOutput>;
}

/// The one pipeline operations go through: shutdown check, permission check,
/// execution, audit.
pub struct OperationService<E: OperationExecutor> {
    policy: PolicyEngine,
    executor: Arc<E>,
    audit: Arc<AuditLog>,
    kill_switch: KillSwitch,
    home: PathBuf,
    metrics: Option<Arc<AgentMetrics>>,
}

impl<E: OperationExecutor> OperationService<E> {
    pub fn new(
        policy: PolicyEngine,
        executor: Arc<E>,
        audit: Arc<AuditLog>,
        kill_switch: KillSwitch,
        home: PathBuf,
        metrics: Option<Arc<AgentMetrics>>,
    ) -> Self {
        Self {
            policy,
            executor,
            audit,
            kill_switch,
            home,
            metrics,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    pub fn is_shutting_down(&self) -> bool {
        self.kill_switch.is_engaged()
    }

    pub fn grant(&self) -> Arc<SessionGrant> {
        self.policy.grant()
    }

    pub async fn perform(
        &self,
        origin: Origin,
        operation: Operation,
    ) -> OperationResult<OperationOutput> {
        let name = operation.name();
        if self.kill_switch.is_engaged() {
            return Err(self.reject(origin, name, operation.target(), OperationError::ShuttingDown));
        }

        let operation = anchored(operation, &self.home);
        let target = operation.target();
        let decision = self.policy.evaluate(&operation);
        if let Some(metrics) = &self.metrics {
            metrics.record_permission_evaluation(decision.is_allowed());
        }
        if let PolicyDecision::Deny(reason) = decision {
            warn!(operation = name, %target, %origin, reason = reason.code(), "operation denied");
            if let Some(metrics) = &self.metrics {
                metrics.record_permission_denial(name, reason.code());
            }
            return Err(self.reject(
                origin,
                name,
                target,
                OperationError::PermissionDenied { reason },
            ));
        }

        let started = Instant::now();
        let result = self.executor.execute(&operation).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_operation_latency(
                started.elapsed().as_secs_f64() * 1000.0,
                name,
                origin.as_str(),
            );
        }

        match result {
            Ok(output) => {
                self.audit.append(AuditRecord::new(
                    name,
                    target,
                    AuditOutcome::Success,
                    origin,
                ));
                Ok(output)
            }
            Err(err) => {
                let err = OperationError::from(err);
                warn!(operation = name, %target, %origin, error = %err, "operation failed");
                self.audit.append(
                    AuditRecord::new(name, target, AuditOutcome::Error, origin)
                        .with_reason(err.to_string()),
                );
                Err(err)
            }
        }
    }

    /// Replaces the session grant and reports the effective result.
    pub fn approve_plan(&self, origin: Origin, approval: PlanApproval) -> OperationResult<GrantView> {
        const NAME: &str = "plan.approve";
        let target = approval.mode.to_string();
        if self.kill_switch.is_engaged() {
            return Err(self.reject(origin, NAME, target, OperationError::ShuttingDown));
        }
        match self.policy.approve_plan(&approval) {
            Ok(grant) => {
                self.audit.append(AuditRecord::new(
                    NAME,
                    target,
                    AuditOutcome::Success,
                    origin,
                ));
                Ok(grant.view())
            }
            Err(err) => {
                let err = OperationError::Invalid(err.to_string());
                self.audit.append(
                    AuditRecord::new(NAME, target, AuditOutcome::Error, origin)
                        .with_reason(err.to_string()),
                );
                Err(err)
            }
        }
    }

    /// Engages the kill switch. Only the first call succeeds.
    pub fn kill(&self, origin: Origin) -> OperationResult<()> {
        const NAME: &str = "agent.kill";
        if !self.kill_switch.engage() {
            return Err(OperationError::ShuttingDown);
        }
        info!(%origin, "kill requested");
        self.audit
            .append(AuditRecord::new(NAME, "agent", AuditOutcome::Success, origin));
        Ok(())
    }

    /// Records a request for `name` whose arguments could not be decoded.
    pub fn reject_malformed(
        &self,
        origin: Origin,
        name: &str,
        message: impl Into<String>,
    ) -> OperationError {
        if self.kill_switch.is_engaged() {
            let target = UNDECODED_TARGET.to_string();
            return self.reject(origin, name, target, OperationError::ShuttingDown);
        }
        let err = OperationError::Invalid(message.into());
        warn!(operation = name, %origin, error = %err, "rejected malformed request");
        self.audit.append(
            AuditRecord::new(name, UNDECODED_TARGET, AuditOutcome::Error, origin)
                .with_reason(err.to_string()),
        );
        err
    }

    pub fn audit_tail(&self, limit: Option<usize>) -> OperationResult<Vec<AuditEntry>> {
        if self.kill_switch.is_engaged() {
            return Err(OperationError::ShuttingDown);
        }
        Ok(self.audit.tail(limit))
    }

    fn reject(
        &self,
        origin: Origin,
        name: &str,
        target: String,
        err: OperationError,
    ) -> OperationError {
        let outcome = match err {
            OperationError::PermissionDenied { .. } | OperationError::ShuttingDown => {
                AuditOutcome::Denied
            }
            _ => AuditOutcome::Error,
        };
        let mut record = AuditRecord::new(name, target, outcome, origin);
        if let Some(reason) = err.reason() {
            record = record.with_reason(reason);
        }
        self.audit.append(record);
        err
    }
}

#[async_trait]
impl<E: OperationExecutor + 'static> OperationPort for OperationService<E> {
    async fn perform(&self, origin: Origin, operation: Operation) -> OperationResult<OperationOutput> {
        OperationService::perform(self, origin, operation).await
    }
}

/// Anchors relative and `~` paths at the home directory and gives `exec.run`
/// its default working directory, so the permission check and the executor
/// see the same paths.
fn anchored(operation: Operation, home: &Path) -> Operation {
    let anchor = |path: PathBuf| anchor_path(&path, home);
    match operation {
        Operation::List(mut args) => {
            args.path = anchor(args.path);
            Operation::List(args)
        }
        Operation::Read(mut args) => {
            args.path = anchor(args.path);
            Operation::Read(args)
        }
        Operation::Write(mut args) => {
            args.path = anchor(args.path);
            Operation::Write(args)
        }
        Operation::Move(mut args) => {
            args.from = anchor(args.from);
            args.to = anchor(args.to);
            Operation::Move(args)
        }
        Operation::Copy(mut args) => {
            args.from = anchor(args.from);
            args.to = anchor(args.to);
            Operation::Copy(args)
        }
        Operation::Delete(mut args) => {
            args.path = anchor(args.path);
            Operation::Delete(args)
        }
        Operation::Create(mut args) => {
            args.path = anchor(args.path);
            Operation::Create(args)
        }
        Operation::Exec(mut args) => {
            args.cwd = Some(args.cwd.map(anchor).unwrap_or_else(|| home.to_path_buf()));
            Operation::Exec(args)
        }
    }
}
