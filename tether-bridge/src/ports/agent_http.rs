use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tether_proto::{ErrorBody, Operation};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectCallError {
    /// Nothing was sent; the agent never saw the request.
    #[error("agent refused the connection: {0}")]
    Refused(String),
    #[error("agent did not answer within {0:?}")]
    TimedOut(Duration),
    /// The request may have reached the agent.
    #[error("direct transport failed: {0}")]
    Transport(String),
    /// The agent answered with a structured error.
    #[error("agent answered {0}")]
    Agent(ErrorBody),
}

impl DirectCallError {
    /// True when the failure proves the agent never received the request.
    pub fn before_delivery(&self) -> bool {
        matches!(self, DirectCallError::Refused(_))
    }
}

/// Direct HTTP access to an agent's loopback surface.
#[async_trait]
pub trait AgentHttp: Send + Sync {
    /// `GET /health`; any failure counts as unhealthy.
    async fn probe(&self, port: u16) -> bool;

    async fn call(
        &self,
        port: u16,
        secret: &str,
        operation: &Operation,
        timeout: Duration,
    ) -> Result<Value, DirectCallError>;
}
