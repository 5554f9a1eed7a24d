//! Configuration and credential storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::RetryPolicy;
use crate::auth::{Credentials, TokenStorage};

/// Environment variable that overrides `base_url`.
pub const BASE_URL_ENV: &str = "ERP_API_URL";

/// Used when neither the config file nor the environment name a backend.
pub const DEFAULT_BASE_URL: &str = "http://localhost:5000/api";

/// Application settings (`config.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Backend API root, e.g. `https://erp.example.com/api`
    pub base_url: String,
    /// Per-attempt timeout
    pub timeout_ms: u64,
    /// Attempts per idempotent request, including the first
    pub retry_attempts: u32,
    /// First backoff delay; doubles on every further retry
    pub retry_base_delay_ms: u64,
    /// How long before expiry the expiring-soon warning fires
    pub expiry_lead_ms: u64,
    /// Sign-in endpoint (never sent a bearer token)
    pub login_path: String,
    /// Renewal endpoint (never sent a bearer token)
    pub refresh_path: String,
    /// Path prefixes readable anonymously; GETs under them skip auth
    pub public_paths: Vec<String>,
    /// Query parameters merged under every request's own
    pub default_query: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_ms: 15_000,
            retry_attempts: 3,
            retry_base_delay_ms: 300,
            expiry_lead_ms: 120_000,
            login_path: "/auth/login".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            public_paths: Vec::new(),
            default_query: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Get config directory path
    pub fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "erp-cli", "erp-cli")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Load `config.toml` (defaults if absent), then apply `ERP_API_URL`.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join("config.toml");

        let mut settings = if path.exists() {
            let content = fs::read_to_string(&path).context("Failed to read config file")?;
            Self::from_toml_str(&content)?
        } else {
            Self::default()
        };

        settings.apply_env(std::env::var(BASE_URL_ENV).ok());
        Ok(settings)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    fn apply_env(&mut self, base_url: Option<String>) {
        if let Some(url) = base_url.filter(|u| !u.trim().is_empty()) {
            self.base_url = url;
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn expiry_lead(&self) -> Duration {
        Duration::from_millis(self.expiry_lead_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }
}

/// Credential pair persisted to `credentials.toml`.
///
/// A missing file, or a missing key inside it, reads as "logged out".
#[derive(Debug, Clone)]
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `credentials.toml` next to `config.toml`.
    pub fn default_location() -> Result<Self> {
        Ok(Self::new(Settings::config_dir()?.join("credentials.toml")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStorage for CredentialFile {
    fn load(&self) -> Result<Credentials> {
        if !self.path.exists() {
            return Ok(Credentials::default());
        }

        let content = fs::read_to_string(&self.path).context("Failed to read credentials file")?;
        toml::from_str(&content).context("Failed to parse credentials file")
    }

    fn store(&mut self, credentials: &Credentials) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content =
            toml::to_string_pretty(credentials).context("Failed to serialize credentials")?;
        fs::write(&self.path, content).context("Failed to write credentials file")?;

        // Set restrictive permissions (contains tokens)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.path, perms)
                .context("Failed to set credentials file permissions")?;
        }

        Ok(())
    }
}
