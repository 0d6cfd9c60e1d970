use crate::domain::output::OperationOutput;
use async_trait::async_trait;
use std::time::Duration;
use tether_proto::Operation;

#[derive(thiserror::Error, Debug)]
pub enum ExecutorError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Failed(String),
}

/// Carries out an operation that has already been allowed.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, operation: &Operation) -> Result<OperationOutput, ExecutorError>;
}
