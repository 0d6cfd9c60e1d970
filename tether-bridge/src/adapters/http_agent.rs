use crate::ports::agent_http::{AgentHttp, DirectCallError};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::net::IpAddr;
use std::time::Duration;
use tether_proto::{ErrorBody, ErrorCode, Operation};
use tracing::debug;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Talks to agents on `host:<announced port>` with reqwest.
pub struct HttpAgentClient {
    client: Client,
    host: IpAddr,
    probe_timeout: Duration,
}

impl HttpAgentClient {
    pub fn new(host: IpAddr, probe_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(probe_timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            host,
            probe_timeout,
        })
    }

    fn url(&self, port: u16, path: &str) -> String {
        match self.host {
            IpAddr::V4(host) => format!("http://{host}:{port}{path}"),
            IpAddr::V6(host) => format!("http://[{host}]:{port}{path}"),
        }
    }
}

#[async_trait]
impl AgentHttp for HttpAgentClient {
    async fn probe(&self, port: u16) -> bool {
        let result = self
            .client
            .get(self.url(port, "/health"))
            .timeout(self.probe_timeout)
            .send()
            .await;
        match result {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(port, error = %err, "health probe failed");
                false
            }
        }
    }

    async fn call(
        &self,
        port: u16,
        secret: &str,
        operation: &Operation,
        timeout: Duration,
    ) -> Result<Value, DirectCallError> {
        let body = operation
            .body()
            .map_err(|err| DirectCallError::Transport(format!("encoding request: {err}")))?;
        let response = self
            .client
            .post(self.url(port, operation.endpoint()))
            .bearer_auth(secret)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|err| classify(err, timeout))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|err| classify(err, timeout));
        }
        let text = response
            .text()
            .await
            .map_err(|err| classify(err, timeout))?;
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(error) => Err(DirectCallError::Agent(error)),
            Err(_) => Err(DirectCallError::Agent(ErrorBody::new(
                fallback_code(status.as_u16()),
                format!("agent returned {status}"),
            ))),
        }
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> DirectCallError {
    if err.is_connect() {
        DirectCallError::Refused(err.to_string())
    } else if err.is_timeout() {
        DirectCallError::TimedOut(timeout)
    } else {
        DirectCallError::Transport(err.to_string())
    }
}

/// Code for an error response whose body is not an `ErrorBody`.
fn fallback_code(status: u16) -> ErrorCode {
    match status {
        400 | 422 => ErrorCode::InvalidRequest,
        401 => ErrorCode::Unauthorized,
        403 => ErrorCode::PermissionDenied,
        404 => ErrorCode::NotFound,
        429 => ErrorCode::Busy,
        503 => ErrorCode::AgentUnavailable,
        504 => ErrorCode::Timeout,
        _ => ErrorCode::ExecutionFailed,
    }
}
