use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

/// The closed set of operations an agent performs on behalf of a caller.
///
/// On the relay the variant is carried in the `operation` field next to the
/// arguments; on the agent's HTTP surface the variant is implied by the
/// endpoint and the body holds only the arguments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation")]
pub enum Operation {
    #[serde(rename = "fs.list")]
    List(ListArgs),
    #[serde(rename = "fs.read")]
    Read(ReadArgs),
    #[serde(rename = "fs.write")]
    Write(WriteArgs),
    #[serde(rename = "fs.move")]
    Move(TransferArgs),
    #[serde(rename = "fs.copy")]
    Copy(TransferArgs),
    #[serde(rename = "fs.delete")]
    Delete(DeleteArgs),
    #[serde(rename = "fs.create")]
    Create(CreateArgs),
    #[serde(rename = "exec.run")]
    Exec(ExecArgs),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::List(_) => "fs.list",
            Operation::Read(_) => "fs.read",
            Operation::Write(_) => "fs.write",
            Operation::Move(_) => "fs.move",
            Operation::Copy(_) => "fs.copy",
            Operation::Delete(_) => "fs.delete",
            Operation::Create(_) => "fs.create",
            Operation::Exec(_) => "exec.run",
        }
    }

    /// Agent HTTP route serving this operation.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Operation::List(_) => "/fs/list",
            Operation::Read(_) => "/fs/read",
            Operation::Write(_) => "/fs/write",
            Operation::Move(_) => "/fs/move",
            Operation::Copy(_) => "/fs/copy",
            Operation::Delete(_) => "/fs/delete",
            Operation::Create(_) => "/fs/create",
            Operation::Exec(_) => "/execute",
        }
    }

    /// True when replaying the operation cannot change anything on the host.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Operation::List(_) | Operation::Read(_))
    }

    /// Human-readable subject of the operation, as recorded in audit entries.
    pub fn target(&self) -> String {
        match self {
            Operation::List(args) => args.path.display().to_string(),
            Operation::Read(args) => args.path.display().to_string(),
            Operation::Write(args) => args.path.display().to_string(),
            Operation::Move(args) | Operation::Copy(args) => {
                format!("{} -> {}", args.from.display(), args.to.display())
            }
            Operation::Delete(args) => args.path.display().to_string(),
            Operation::Create(args) => args.path.display().to_string(),
            Operation::Exec(args) => args.command.clone(),
        }
    }

    /// Request body for the agent HTTP endpoint (arguments without the tag).
    pub fn body(&self) -> serde_json::Result<Value> {
        match self {
            Operation::List(args) => serde_json::to_value(args),
            Operation::Read(args) => serde_json::to_value(args),
            Operation::Write(args) => serde_json::to_value(args),
            Operation::Move(args) | Operation::Copy(args) => serde_json::to_value(args),
            Operation::Delete(args) => serde_json::to_value(args),
            Operation::Create(args) => serde_json::to_value(args),
            Operation::Exec(args) => serde_json::to_value(args),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name(), self.target())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListArgs {
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadArgs {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    Utf8,
    Base64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteArgs {
    pub path: PathBuf,
    pub content: String,
    #[serde(default)]
    pub encoding: ContentEncoding,
    #[serde(default)]
    pub append: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferArgs {
    pub from: PathBuf,
    pub to: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteArgs {
    pub path: PathBuf,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateArgs {
    pub path: PathBuf,
    pub kind: EntryKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecArgs {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}
