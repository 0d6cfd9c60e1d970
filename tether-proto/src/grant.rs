use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    Safe,
    Balanced,
    Unrestricted,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Safe => "safe",
            PermissionMode::Balanced => "balanced",
            PermissionMode::Unrestricted => "unrestricted",
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PermissionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "safe" => Ok(PermissionMode::Safe),
            "balanced" => Ok(PermissionMode::Balanced),
            "unrestricted" => Ok(PermissionMode::Unrestricted),
            other => Err(format!("unknown permission mode '{other}'")),
        }
    }
}

/// Coarse operation classes a grant can allow. Listing a directory is a read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    #[serde(alias = "list")]
    Read,
    Write,
    Delete,
    Execute,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Read,
        OperationKind::Write,
        OperationKind::Delete,
        OperationKind::Execute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Delete => "delete",
            OperationKind::Execute => "execute",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "read" | "list" => Ok(OperationKind::Read),
            "write" => Ok(OperationKind::Write),
            "delete" => Ok(OperationKind::Delete),
            "execute" | "exec" => Ok(OperationKind::Execute),
            other => Err(format!("unknown operation kind '{other}'")),
        }
    }
}

/// Body of `POST /plan/approve`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanApproval {
    pub mode: PermissionMode,
    #[serde(default)]
    pub allowed_directories: Vec<PathBuf>,
    #[serde(default)]
    pub allowed_operations: Vec<OperationKind>,
}

/// Effective grant as reported back to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantView {
    pub mode: PermissionMode,
    pub allowed_directories: Vec<PathBuf>,
    pub allowed_operations: Vec<OperationKind>,
    pub revision: u64,
    pub approved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_accepts_list_alias() {
        let kinds: Vec<OperationKind> = serde_json::from_str(r#"["list","write"]"#).unwrap();
        assert_eq!(kinds, vec![OperationKind::Read, OperationKind::Write]);
        assert_eq!("EXEC".parse::<OperationKind>().unwrap(), OperationKind::Execute);
    }

    #[test]
    fn approval_defaults_empty_sets() {
        let approval: PlanApproval = serde_json::from_str(r#"{"mode":"unrestricted"}"#).unwrap();
        assert_eq!(approval.mode, PermissionMode::Unrestricted);
        assert!(approval.allowed_directories.is_empty());
        assert!(approval.allowed_operations.is_empty());
    }

    #[test]
    fn mode_rejects_unknown() {
        assert!("yolo".parse::<PermissionMode>().is_err());
        assert!(serde_json::from_str::<PlanApproval>(r#"{"mode":"yolo"}"#).is_err());
    }
}
