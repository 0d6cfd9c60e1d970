use crate::ports::command_runner::{CommandOutput, CommandRequest, CommandRunner, RunnerError};
use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Runs commands through the platform shell, at most `max_concurrent` at a
/// time. Each child leads its own process group so a timeout takes down
/// everything it spawned.
pub struct ShellCommandRunner {
    permits: Arc<Semaphore>,
}

impl ShellCommandRunner {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    fn command(request: &CommandRequest) -> Command {
        #[cfg(windows)]
        let mut command = {
            let mut cmd = Command::new("cmd.exe");
            cmd.arg("/C").arg(&request.command);
            cmd
        };
        #[cfg(not(windows))]
        let mut command = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&request.command);
            cmd
        };
        #[cfg(unix)]
        command.process_group(0);

        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl Default for ShellCommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(&self, request: &CommandRequest) -> Result<CommandOutput, RunnerError> {
        let started = Instant::now();
        let _permit = match timeout(request.timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(RunnerError::Closed),
            Err(_) => {
                warn!(command = %request.command, "timed out waiting for an exec slot");
                return Err(RunnerError::Timeout(request.timeout));
            }
        };
        let remaining = request.timeout.saturating_sub(started.elapsed());

        let mut child = Self::command(request)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                command: request.command.clone(),
                source,
            })?;
        let pid = child.id();
        debug!(command = %request.command, ?pid, "spawned command");

        let limit = request.max_output_bytes;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let collect = async {
            let ((stdout, stdout_truncated), (stderr, stderr_truncated), status) = tokio::try_join!(
                read_capped(stdout, limit),
                read_capped(stderr, limit),
                child.wait(),
            )?;
            Ok::<_, io::Error>(CommandOutput {
                status,
                stdout,
                stderr,
                stdout_truncated,
                stderr_truncated,
            })
        };

        match timeout(remaining, collect).await {
            Ok(output) => Ok(output?),
            Err(_) => {
                kill_process_group(pid);
                warn!(command = %request.command, ?pid, "command timed out; process group killed");
                Err(RunnerError::Timeout(request.timeout))
            }
        }
    }
}

const READ_CHUNK: usize = 8 * 1024;

/// Drains `pipe` to EOF, keeping at most `limit` bytes.
async fn read_capped<R: AsyncRead + Unpin>(
    pipe: Option<R>,
    limit: usize,
) -> io::Result<(Vec<u8>, bool)> {
    let Some(mut pipe) = pipe else {
        return Ok((Vec::new(), false));
    };
    let mut kept = Vec::with_capacity(limit.min(READ_CHUNK));
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut truncated = false;
    loop {
        let read = pipe.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        if read > room {
            truncated = true;
        }
        kept.extend_from_slice(&chunk[..read.min(room)]);
    }
    Ok((kept, truncated))
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the group id came from our own child.
    let rc = unsafe { libc::killpg(pid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(command: &str, timeout: Duration) -> CommandRequest {
        CommandRequest {
            command: command.to_string(),
            cwd: None,
            timeout,
            max_output_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn runner_executes_command() {
        let runner = ShellCommandRunner::default();
        let output = runner
            .run(&request("echo ok", Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&output.stdout).contains("ok"));
        assert_eq!(runner.available_slots(), DEFAULT_MAX_CONCURRENT);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_whole_group() {
        let runner = ShellCommandRunner::default();
        let started = Instant::now();
        let err = runner
            .run(&request("sleep 5 & sleep 5; wait", Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn queued_time_counts_against_timeout() {
        let runner = Arc::new(ShellCommandRunner::new(1));
        let holder = {
            let runner = runner.clone();
            tokio::spawn(async move {
                runner
                    .run(&request("sleep 1", Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = runner
            .run(&request("echo late", Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout(_)));
        assert!(holder.await.unwrap().is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_beyond_the_limit_is_discarded_while_reading() {
        let runner = ShellCommandRunner::default();
        let mut req = request(
            "head -c 20000000 /dev/zero; printf tail >&2",
            Duration::from_secs(20),
        );
        req.max_output_bytes = 256 * 1024;
        let output = runner.run(&req).await.unwrap();
        assert_eq!(output.stdout.len(), 256 * 1024);
        assert!(output.stdout_truncated);
        assert_eq!(output.stderr, b"tail");
        assert!(!output.stderr_truncated);
        assert!(output.status.success());
    }

    #[tokio::test]
    async fn spawn_failure_names_the_command() {
        let runner = ShellCommandRunner::default();
        let mut req = request("echo hi", Duration::from_secs(5));
        req.cwd = Some("/definitely/not/a/dir".into());
        let err = runner.run(&req).await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }
}
