//! Centralized configuration for Kite nodes.
//!
//! `ProtocolConfig` holds wire and networking constants. `KiteConfig` is the
//! plain data source for identity fields, the Kontrol key bootstrap list and
//! session policy. It can be loaded from a JSON file and overlaid with `KITE_*`
//! environment variables.

use crate::{KiteError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Wire and networking constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const JSONRPC_VERSION: &'static str = "2.0";
    pub const MAX_MESSAGE_SIZE: usize = 1_048_576; // 1MB
    pub const MAX_CONNECTIONS: usize = 1024;
    pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Shared directory and file names.
pub struct PathsConfig;

impl PathsConfig {
    pub const KITE_DIR_NAME: &'static str = ".kite";
    pub const CONFIG_FILENAME: &'static str = "config.json";
}

/// Environment variable names read by [`KiteConfig::apply_env`].
pub struct EnvConfig;

impl EnvConfig {
    pub const USERNAME: &'static str = "KITE_USERNAME";
    pub const ENVIRONMENT: &'static str = "KITE_ENVIRONMENT";
    pub const REGION: &'static str = "KITE_REGION";
    pub const KONTROL_USER: &'static str = "KITE_KONTROL_USER";
    pub const KONTROL_KEY: &'static str = "KITE_KONTROL_KEY";
    pub const LOG_LEVEL: &'static str = "KITE_LOG_LEVEL";
}

/// Node configuration supplied by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KiteConfig {
    pub username: String,
    pub environment: String,
    pub region: String,

    /// Issuer name Kontrol signs its tokens with.
    pub kontrol_user: Option<String>,
    /// PEM public key matching `kontrol_user`.
    pub kontrol_key: Option<String>,
    /// Additional issuer → PEM public key pairs trusted at startup.
    pub trusted_keys: BTreeMap<String, String>,

    /// Skip authentication entirely and trust the identity a peer claims.
    pub disable_authentication: bool,
    /// Close a session after this many failed authentication attempts.
    /// `None` allows unlimited retries.
    pub max_auth_failures: Option<u32>,
}

impl Default for KiteConfig {
    fn default() -> Self {
        Self {
            username: "unknown".to_string(),
            environment: "unknown".to_string(),
            region: "unknown".to_string(),
            kontrol_user: None,
            kontrol_key: None,
            trusted_keys: BTreeMap::new(),
            disable_authentication: false,
            max_auth_failures: None,
        }
    }
}

impl KiteConfig {
    /// Default config location: `~/.kite/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| {
            home.join(PathsConfig::KITE_DIR_NAME)
                .join(PathsConfig::CONFIG_FILENAME)
        })
    }

    /// Load a config file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| KiteError::Io {
            message: format!("Failed to read config file {}: {}", path.display(), e),
            source: Some(e),
        })?;
        serde_json::from_str(&data).map_err(|e| {
            KiteError::config(format!("Invalid config file {}: {}", path.display(), e))
        })
    }

    /// Load from `path` if given, else from the default location if it exists,
    /// else start from defaults. Environment variables are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env();
        Ok(config)
    }

    /// Overlay `KITE_*` environment variables onto this config.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(v) = non_empty(EnvConfig::USERNAME) {
            self.username = v;
        }
        if let Some(v) = non_empty(EnvConfig::ENVIRONMENT) {
            self.environment = v;
        }
        if let Some(v) = non_empty(EnvConfig::REGION) {
            self.region = v;
        }
        if let Some(v) = non_empty(EnvConfig::KONTROL_USER) {
            self.kontrol_user = Some(v);
        }
        if let Some(v) = non_empty(EnvConfig::KONTROL_KEY) {
            self.kontrol_key = Some(v);
        }
    }

    /// Every issuer → key pair this node should trust at startup.
    pub fn bootstrap_keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<(String, String)> = self
            .trusted_keys
            .iter()
            .map(|(issuer, key)| (issuer.clone(), key.clone()))
            .collect();
        if let (Some(user), Some(key)) = (&self.kontrol_user, &self.kontrol_key) {
            keys.push((user.clone(), key.clone()));
        }
        keys
    }
}
