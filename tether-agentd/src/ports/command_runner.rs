use async_trait::async_trait;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub command: String,
    pub cwd: Option<PathBuf>,
    /// Wall-clock budget, including any time spent waiting for a slot.
    pub timeout: Duration,
    /// Bytes kept per stream; anything beyond is read and discarded.
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to spawn command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command runner is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: &CommandRequest) -> Result<CommandOutput, RunnerError>;
}
