pub mod command_runner;

use crate::domain::output::{
    CopyReceipt, CreateReceipt, DirEntry, ExecOutput, FileContent, Listing, MoveReceipt,
    OperationOutput, PathReceipt, WriteReceipt,
};
use crate::ports::command_runner::{CommandRequest, CommandRunner, RunnerError};
use crate::ports::executor::{ExecutorError, OperationExecutor};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::future::BoxFuture;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_proto::{
    ContentEncoding, CreateArgs, DeleteArgs, EntryKind, ExecArgs, Operation, ReadArgs,
    TransferArgs, WriteArgs,
};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

pub use command_runner::ShellCommandRunner;

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_EXEC_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_READ_BYTES: u64 = 1024 * 1024;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub default_exec_timeout: Duration,
    pub max_exec_timeout: Duration,
    pub default_read_bytes: u64,
    pub max_output_bytes: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            default_exec_timeout: DEFAULT_EXEC_TIMEOUT,
            max_exec_timeout: DEFAULT_MAX_EXEC_TIMEOUT,
            default_read_bytes: DEFAULT_READ_BYTES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Executes allowed operations against the local filesystem and shell.
pub struct LocalExecutor<R: CommandRunner> {
    runner: Arc<R>,
    settings: ExecutorSettings,
}

impl<R: CommandRunner> LocalExecutor<R> {
    pub fn new(runner: Arc<R>, settings: ExecutorSettings) -> Self {
        Self { runner, settings }
    }

    async fn list(&self, path: &Path) -> Result<Listing, ExecutorError> {
        let mut dir = fs::read_dir(path).await.map_err(|err| io_error(path, err))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|err| io_error(path, err))? {
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| io_error(&entry.path(), err))?;
            let size = if file_type.is_file() {
                entry.metadata().await.map(|meta| meta.len()).unwrap_or(0)
            } else {
                0
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: entry_kind(&file_type),
                size,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Listing {
            path: path.to_path_buf(),
            entries,
        })
    }

    async fn read(&self, args: &ReadArgs) -> Result<FileContent, ExecutorError> {
        let path = args.path.as_path();
        let metadata = fs::metadata(path).await.map_err(|err| io_error(path, err))?;
        if metadata.is_dir() {
            return Err(ExecutorError::Invalid(format!(
                "{} is a directory",
                path.display()
            )));
        }
        let limit = args.max_bytes.unwrap_or(self.settings.default_read_bytes);
        let file = fs::File::open(path).await.map_err(|err| io_error(path, err))?;
        let mut buffer = Vec::with_capacity(limit.min(metadata.len()) as usize);
        file.take(limit)
            .read_to_end(&mut buffer)
            .await
            .map_err(|err| io_error(path, err))?;
        let truncated = metadata.len() > buffer.len() as u64;
        let (content, encoding) = encode_content(buffer, truncated);
        Ok(FileContent {
            path: path.to_path_buf(),
            content,
            encoding,
            size: metadata.len(),
            truncated,
        })
    }

    async fn write(&self, args: &WriteArgs) -> Result<WriteReceipt, ExecutorError> {
        let path = args.path.as_path();
        let bytes = match args.encoding {
            ContentEncoding::Utf8 => args.content.as_bytes().to_vec(),
            ContentEncoding::Base64 => BASE64.decode(args.content.as_bytes()).map_err(|err| {
                ExecutorError::Invalid(format!("content is not valid base64: {err}"))
            })?,
        };
        if is_dir(path).await {
            return Err(ExecutorError::Invalid(format!(
                "{} is a directory",
                path.display()
            )));
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(args.append)
            .truncate(!args.append)
            .open(path)
            .await
            .map_err(|err| io_error(path, err))?;
        file.write_all(&bytes)
            .await
            .map_err(|err| io_error(path, err))?;
        file.flush().await.map_err(|err| io_error(path, err))?;
        Ok(WriteReceipt {
            path: path.to_path_buf(),
            bytes_written: bytes.len() as u64,
        })
    }

    async fn rename(&self, args: &TransferArgs) -> Result<MoveReceipt, ExecutorError> {
        fs::symlink_metadata(&args.from)
            .await
            .map_err(|err| io_error(&args.from, err))?;
        fs::rename(&args.from, &args.to)
            .await
            .map_err(|err| io_error(&args.to, err))?;
        Ok(MoveReceipt {
            from: args.from.clone(),
            to: args.to.clone(),
        })
    }

    async fn copy(&self, args: &TransferArgs) -> Result<CopyReceipt, ExecutorError> {
        let metadata = fs::metadata(&args.from)
            .await
            .map_err(|err| io_error(&args.from, err))?;
        let bytes_copied = if metadata.is_dir() {
            if args.to.starts_with(&args.from) {
                return Err(ExecutorError::Invalid(format!(
                    "cannot copy {} into itself",
                    args.from.display()
                )));
            }
            copy_dir(&args.from, &args.to)
                .await
                .map_err(|err| io_error(&args.to, err))?
        } else {
            fs::copy(&args.from, &args.to)
                .await
                .map_err(|err| io_error(&args.to, err))?
        };
        Ok(CopyReceipt {
            from: args.from.clone(),
            to: args.to.clone(),
            bytes_copied,
        })
    }

    async fn delete(&self, args: &DeleteArgs) -> Result<PathReceipt, ExecutorError> {
        let path = args.path.as_path();
        if path.parent().is_none() {
            return Err(ExecutorError::Invalid(
                "refusing to delete a filesystem root".to_string(),
            ));
        }
        let metadata = fs::symlink_metadata(path)
            .await
            .map_err(|err| io_error(path, err))?;
        let removed = if metadata.is_dir() {
            if args.recursive {
                fs::remove_dir_all(path).await
            } else {
                let mut dir = fs::read_dir(path).await.map_err(|err| io_error(path, err))?;
                if dir
                    .next_entry()
                    .await
                    .map_err(|err| io_error(path, err))?
                    .is_some()
                {
                    return Err(ExecutorError::Invalid(format!(
                        "{} is not empty; pass recursive to delete it",
                        path.display()
                    )));
                }
                fs::remove_dir(path).await
            }
        } else {
            fs::remove_file(path).await
        };
        removed.map_err(|err| io_error(path, err))?;
        Ok(PathReceipt {
            path: path.to_path_buf(),
        })
    }

    async fn create(&self, args: &CreateArgs) -> Result<CreateReceipt, ExecutorError> {
        let path = args.path.as_path();
        match args.kind {
            EntryKind::File => {
                fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(path)
                    .await
                    .map_err(|err| io_error(path, err))?;
            }
            EntryKind::Directory => {
                fs::create_dir(path)
                    .await
                    .map_err(|err| io_error(path, err))?;
            }
            other => {
                return Err(ExecutorError::Invalid(format!(
                    "cannot create entries of kind {other:?}"
                )))
            }
        }
        Ok(CreateReceipt {
            path: path.to_path_buf(),
            kind: args.kind,
        })
    }

    async fn exec(&self, args: &ExecArgs) -> Result<ExecOutput, ExecutorError> {
        if args.command.trim().is_empty() {
            return Err(ExecutorError::Invalid("command must not be empty".to_string()));
        }
        let timeout = args
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.settings.default_exec_timeout)
            .min(self.settings.max_exec_timeout);
        if timeout.is_zero() {
            return Err(ExecutorError::Invalid("timeoutMs must be positive".to_string()));
        }
        let request = CommandRequest {
            command: args.command.clone(),
            cwd: args.cwd.clone(),
            timeout,
            max_output_bytes: self.settings.max_output_bytes,
        };

        let started = Instant::now();
        let output = self.runner.run(&request).await.map_err(|err| match err {
            RunnerError::Timeout(elapsed) => ExecutorError::Timeout(elapsed),
            RunnerError::Spawn { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                let cwd = request
                    .cwd
                    .as_deref()
                    .map(|cwd| cwd.display().to_string())
                    .unwrap_or_else(|| "working directory".to_string());
                ExecutorError::NotFound(cwd)
            }
            other => ExecutorError::Failed(other.to_string()),
        })?;
        let duration_ms = started.elapsed().as_millis() as u64;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            stdout_truncated: output.stdout_truncated,
            stderr_truncated: output.stderr_truncated,
            duration_ms,
        })
    }
}

#[async_trait]
impl<R: CommandRunner + 'static> OperationExecutor for LocalExecutor<R> {
    async fn execute(&self, operation: &Operation) -> Result<OperationOutput, ExecutorError> {
        debug!(operation = operation.name(), target = %operation.target(), "executing");
        match operation {
            Operation::List(args) => self.list(&args.path).await.map(OperationOutput::Listing),
            Operation::Read(args) => self.read(args).await.map(OperationOutput::Content),
            Operation::Write(args) => self.write(args).await.map(OperationOutput::Written),
            Operation::Move(args) => self.rename(args).await.map(OperationOutput::Moved),
            Operation::Copy(args) => self.copy(args).await.map(OperationOutput::Copied),
            Operation::Delete(args) => self.delete(args).await.map(OperationOutput::Deleted),
            Operation::Create(args) => self.create(args).await.map(OperationOutput::Created),
            Operation::Exec(args) => self.exec(args).await.map(OperationOutput::Exec),
        }
    }
}

fn io_error(path: &Path, err: io::Error) -> ExecutorError {
    match err.kind() {
        io::ErrorKind::NotFound => ExecutorError::NotFound(path.display().to_string()),
        io::ErrorKind::AlreadyExists => {
            ExecutorError::Invalid(format!("{} already exists", path.display()))
        }
        _ => ExecutorError::Failed(format!("{}: {err}", path.display())),
    }
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

fn entry_kind(file_type: &std::fs::FileType) -> EntryKind {
    if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    }
}

/// UTF-8 text stays text; anything else goes out as base64. A multi-byte
/// character split by truncation is dropped rather than forcing base64.
fn encode_content(bytes: Vec<u8>, truncated: bool) -> (String, ContentEncoding) {
    match String::from_utf8(bytes) {
        Ok(text) => (text, ContentEncoding::Utf8),
        Err(err) => {
            let utf8 = err.utf8_error();
            let bytes = err.into_bytes();
            if truncated && utf8.error_len().is_none() {
                let valid = &bytes[..utf8.valid_up_to()];
                (String::from_utf8_lossy(valid).into_owned(), ContentEncoding::Utf8)
            } else {
                (BASE64.encode(&bytes), ContentEncoding::Base64)
            }
        }
    }
}

// Symlinks inside a copied tree are skipped: following them could pull in
// content from outside the approved directories.
fn copy_dir<'a>(from: &'a Path, to: &'a Path) -> BoxFuture<'a, io::Result<u64>> {
    Box::pin(async move {
        fs::create_dir_all(to).await?;
        let mut total = 0;
        let mut dir = fs::read_dir(from).await?;
        while let Some(entry) = dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            let source = entry.path();
            let dest = to.join(entry.file_name());
            if file_type.is_dir() {
                total += copy_dir(&source, &dest).await?;
            } else if file_type.is_file() {
                total += fs::copy(&source, &dest).await?;
            } else {
                debug!(path = %source.display(), "skipping non-regular entry during copy");
            }
        }
        Ok(total)
    })
}
