//! Kite identity: who this process is, and who a peer claims to be.
//!
//! A [`KiteIdentity`] is built once at node construction and never changes.
//! The same shape is used as the descriptor a peer sends along with every
//! call, so both sides speak about identities with one type.

use crate::config::KiteConfig;
use crate::{KiteError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity descriptor of a Kite process.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KiteIdentity {
    pub username: String,
    pub environment: String,
    pub name: String,
    pub version: String,
    pub region: String,
    pub hostname: String,
    pub id: String,
}

/// Identity of a peer after authentication succeeded.
pub type PeerIdentity = KiteIdentity;

impl KiteIdentity {
    /// Build and validate the identity of the local node.
    ///
    /// `hostname` is passed in rather than looked up here so that callers can
    /// exercise the failure path; [`resolve_hostname`] supplies it in
    /// production.
    pub fn new(
        name: &str,
        version: &str,
        config: &KiteConfig,
        hostname: Option<String>,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(KiteError::config("name cannot be empty"));
        }
        validate_version(version)?;

        let hostname = hostname
            .filter(|h| !h.is_empty())
            .ok_or_else(|| KiteError::config("cannot resolve hostname"))?;

        Ok(Self {
            username: config.username.clone(),
            environment: config.environment.clone(),
            name: name.to_string(),
            version: version.to_string(),
            region: config.region.clone(),
            hostname,
            id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Components of the key path in order, from most to least general.
    fn key_components(&self) -> [&str; 7] {
        [
            &self.username,
            &self.environment,
            &self.name,
            &self.version,
            &self.region,
            &self.hostname,
            &self.id,
        ]
    }

    /// `/username/environment/name/version/region/hostname/id`.
    pub fn key_path(&self) -> String {
        let mut path = String::new();
        for part in self.key_components() {
            path.push('/');
            path.push_str(part);
        }
        path
    }

    /// Whether `query` addresses this identity.
    ///
    /// The query is a key path prefix: `/`, `/alice`, `/alice/production/math`
    /// all match a kite owned by alice in production named math. Empty trailing
    /// segments are ignored.
    pub fn matches_query(&self, query: &str) -> bool {
        let trimmed = query.trim_matches('/');
        if trimmed.is_empty() {
            return true;
        }

        let parts: Vec<&str> = trimmed.split('/').collect();
        if parts.len() > 7 {
            return false;
        }
        parts
            .iter()
            .zip(self.key_components())
            .all(|(want, have)| want.is_empty() || *want == have)
    }
}

impl fmt::Display for KiteIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key_path())
    }
}

/// Version must be exactly three dot-separated numeric components.
pub fn validate_version(version: &str) -> Result<semver::Version> {
    let parsed = semver::Version::parse(version).map_err(|e| {
        KiteError::config(format!(
            "version must be 3-digits semantic version, got {:?}: {}",
            version, e
        ))
    })?;
    if !parsed.pre.is_empty() || !parsed.build.is_empty() {
        return Err(KiteError::config(format!(
            "version must be 3-digits semantic version, got {:?}",
            version
        )));
    }
    Ok(parsed)
}

/// Resolve this machine's hostname once at startup.
pub fn resolve_hostname() -> Option<String> {
    sysinfo::System::host_name()
}
