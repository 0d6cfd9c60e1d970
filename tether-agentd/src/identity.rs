use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use tether_proto::AgentMetadata;

pub const DEFAULT_HTTP_PORT: u16 = 17717;
const MIN_SECRET_LEN: usize = 16;

/// Identity file written by the provisioning step.
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityFile {
    pub user_id: Option<String>,
    pub shared_secret: Option<String>,
    pub home_directory: Option<PathBuf>,
    pub platform: Option<String>,
    pub http_port: Option<u16>,
    pub relay_url: Option<String>,
}

impl IdentityFile {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tether").join("identity.json"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading identity file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing identity file {}", path.display()))
    }
}

impl fmt::Debug for IdentityFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityFile")
            .field("user_id", &self.user_id)
            .field("shared_secret", &self.shared_secret.as_ref().map(|_| "<redacted>"))
            .field("home_directory", &self.home_directory)
            .field("platform", &self.platform)
            .field("http_port", &self.http_port)
            .field("relay_url", &self.relay_url)
            .finish()
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum IdentityError {
    #[error("user id is missing")]
    MissingUserId,
    #[error("shared secret is missing")]
    MissingSecret,
    #[error("shared secret must be at least 16 characters")]
    WeakSecret,
    #[error("home directory is unknown; pass --home-directory")]
    MissingHome,
}

/// Who this agent is. Fixed for the life of the process.
#[derive(Clone)]
pub struct AgentIdentity {
    user_id: String,
    shared_secret: String,
    home_directory: PathBuf,
    platform: String,
    http_port: u16,
}

impl AgentIdentity {
    pub fn new(
        user_id: impl Into<String>,
        shared_secret: impl Into<String>,
        home_directory: impl Into<PathBuf>,
        http_port: u16,
    ) -> Result<Self, IdentityError> {
        let user_id = user_id.into();
        let shared_secret = shared_secret.into();
        if user_id.trim().is_empty() {
            return Err(IdentityError::MissingUserId);
        }
        if shared_secret.is_empty() {
            return Err(IdentityError::MissingSecret);
        }
        if shared_secret.len() < MIN_SECRET_LEN {
            return Err(IdentityError::WeakSecret);
        }
        Ok(Self {
            user_id,
            shared_secret,
            home_directory: home_directory.into(),
            platform: std::env::consts::OS.to_string(),
            http_port,
        })
    }

    /// Builds the identity from a provisioned file, falling back to the
    /// user's home directory and the default port.
    pub fn from_file(file: &IdentityFile) -> Result<Self, IdentityError> {
        let home = file
            .home_directory
            .clone()
            .or_else(dirs::home_dir)
            .ok_or(IdentityError::MissingHome)?;
        let identity = Self::new(
            file.user_id.clone().ok_or(IdentityError::MissingUserId)?,
            file.shared_secret.clone().ok_or(IdentityError::MissingSecret)?,
            home,
            file.http_port.unwrap_or(DEFAULT_HTTP_PORT),
        )?;
        Ok(match &file.platform {
            Some(platform) => identity.with_platform(platform.clone()),
            None => identity,
        })
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn shared_secret(&self) -> &str {
        &self.shared_secret
    }

    pub fn home_directory(&self) -> &Path {
        &self.home_directory
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Constant-time comparison against the provisioned secret.
    pub fn secret_matches(&self, presented: &str) -> bool {
        presented
            .as_bytes()
            .ct_eq(self.shared_secret.as_bytes())
            .into()
    }

    pub fn summary(&self) -> IdentitySummary {
        IdentitySummary {
            user_id: self.user_id.clone(),
            home_directory: self.home_directory.clone(),
            platform: self.platform.clone(),
            http_port: self.http_port,
        }
    }

    pub fn metadata(&self) -> AgentMetadata {
        AgentMetadata {
            home_directory: self.home_directory.clone(),
            platform: self.platform.clone(),
            http_port: Some(self.http_port),
        }
    }
}

impl fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentIdentity")
            .field("user_id", &self.user_id)
            .field("shared_secret", &"<redacted>")
            .field("home_directory", &self.home_directory)
            .field("platform", &self.platform)
            .field("http_port", &self.http_port)
            .finish()
    }
}

/// Public projection of the identity; never carries the secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySummary {
    pub user_id: String,
    pub home_directory: PathBuf,
    pub platform: String,
    pub http_port: u16,
}
