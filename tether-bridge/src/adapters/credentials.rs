use crate::ports::credentials::CredentialStore;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to read credentials from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse credentials in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("user {0} is listed more than once")]
    Duplicate(String),
    #[error("user {0} has an empty shared secret")]
    EmptySecret(String),
}

#[derive(Deserialize)]
struct CredentialFile {
    #[serde(default)]
    agents: Vec<AgentCredential>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentCredential {
    user_id: String,
    shared_secret: String,
}

/// Credentials written by the provisioning pipeline, loaded once at startup.
#[derive(Default)]
pub struct FileCredentialStore {
    secrets: HashMap<String, String>,
}

impl FileCredentialStore {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tether").join("agents.json"))
    }

    pub fn load(path: &Path) -> Result<Self, CredentialError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CredentialError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw).map_err(|err| match err {
            ParseFailure::Json(source) => CredentialError::Parse {
                path: path.to_path_buf(),
                source,
            },
            ParseFailure::Invalid(err) => err,
        })
    }

    fn parse(raw: &str) -> Result<Self, ParseFailure> {
        let file: CredentialFile = serde_json::from_str(raw).map_err(ParseFailure::Json)?;
        let mut secrets = HashMap::with_capacity(file.agents.len());
        for agent in file.agents {
            if agent.shared_secret.is_empty() {
                return Err(ParseFailure::Invalid(CredentialError::EmptySecret(
                    agent.user_id,
                )));
            }
            if secrets.contains_key(&agent.user_id) {
                return Err(ParseFailure::Invalid(CredentialError::Duplicate(
                    agent.user_id,
                )));
            }
            secrets.insert(agent.user_id, agent.shared_secret);
        }
        Ok(Self { secrets })
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

enum ParseFailure {
    Json(serde_json::Error),
    Invalid(CredentialError),
}

impl CredentialStore for FileCredentialStore {
    fn shared_secret(&self, user_id: &str) -> Option<String> {
        self.secrets.get(user_id).cloned()
    }
}

#[derive(Default)]
pub struct InMemoryCredentialStore {
    secrets: RwLock<HashMap<String, String>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, user_id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.insert(user_id, secret);
        self
    }

    pub fn insert(&self, user_id: impl Into<String>, secret: impl Into<String>) {
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.into(), secret.into());
    }

    pub fn remove(&self, user_id: &str) -> bool {
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id)
            .is_some()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn shared_secret(&self, user_id: &str) -> Option<String> {
        self.secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }
}
