//! Authentication of incoming peers.
//!
//! A request names the credential type it carries (`authentication.type`).
//! The [`AuthenticatorRegistry`] is the single place that maps that tag to a
//! strategy and runs it. Two strategies are built in:
//!
//! - `token`: a Kontrol-issued JWT verified against the [`TrustStore`]
//! - `kiteKey`: the peer claims the same username as this node
//!
//! [`TrustStore`]: crate::trust::TrustStore

pub mod kite_key;
pub mod token;

pub use kite_key::SameAccountAuthenticator;
pub use token::{TokenAuthenticator, TokenClaims};

use crate::identity::{KiteIdentity, PeerIdentity};
use crate::{KiteError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error};

/// Tag of the Kontrol token strategy.
pub const TOKEN_AUTH_TYPE: &str = "token";
/// Tag of the same-account strategy.
pub const KITE_KEY_AUTH_TYPE: &str = "kiteKey";

/// Credential attached to a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    #[serde(rename = "type")]
    pub auth_type: String,
    #[serde(default)]
    pub key: String,
}

impl Authentication {
    pub fn new(auth_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            auth_type: auth_type.into(),
            key: key.into(),
        }
    }

    /// Credential for a Kontrol-issued token.
    pub fn token(token: impl Into<String>) -> Self {
        Self::new(TOKEN_AUTH_TYPE, token)
    }

    /// Credential for the same-account shortcut.
    pub fn kite_key(key: impl Into<String>) -> Self {
        Self::new(KITE_KEY_AUTH_TYPE, key)
    }
}

/// What a strategy gets to look at: who the peer claims to be and the
/// credential it presented.
#[derive(Debug, Clone)]
pub struct AuthRequest<'a> {
    pub claimed: &'a KiteIdentity,
    pub credential: &'a Authentication,
}

/// A verification strategy.
///
/// Implementations must treat malformed credentials as a rejection. A panic is
/// caught by the registry and reported as `AuthRejected`, but strategies
/// should not rely on that.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, request: &AuthRequest<'_>) -> Result<PeerIdentity>;
}

impl<F> Authenticator for F
where
    F: Fn(&AuthRequest<'_>) -> Result<PeerIdentity> + Send + Sync + 'static,
{
    fn authenticate(&self, request: &AuthRequest<'_>) -> Result<PeerIdentity> {
        self(request)
    }
}

/// Authentication type tag → strategy.
#[derive(Default)]
pub struct AuthenticatorRegistry {
    strategies: RwLock<HashMap<String, Arc<dyn Authenticator>>>,
}

impl AuthenticatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `strategy` for `auth_type`. A later registration for the same
    /// tag replaces the earlier one.
    pub fn register(&self, auth_type: impl Into<String>, strategy: Arc<dyn Authenticator>) {
        let auth_type = auth_type.into();
        debug!("Registering authenticator {:?}", auth_type);
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(auth_type, strategy);
    }

    pub fn contains(&self, auth_type: &str) -> bool {
        self.strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(auth_type)
    }

    /// Registered tags, sorted.
    pub fn auth_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Run the strategy registered for `auth_type`.
    pub fn authenticate(&self, auth_type: &str, request: &AuthRequest<'_>) -> Result<PeerIdentity> {
        let strategy = self
            .strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(auth_type)
            .cloned()
            .ok_or_else(|| KiteError::UnknownAuthType {
                auth_type: auth_type.to_string(),
            })?;

        match catch_unwind(AssertUnwindSafe(|| strategy.authenticate(request))) {
            Ok(Ok(peer)) => Ok(peer),
            Ok(Err(KiteError::AuthRejected { reason })) => Err(KiteError::AuthRejected { reason }),
            Ok(Err(other)) => Err(KiteError::rejected(other.to_string())),
            Err(_) => {
                error!("Authenticator {:?} panicked", auth_type);
                Err(KiteError::rejected(format!(
                    "authenticator {} failed",
                    auth_type
                )))
            }
        }
    }
}

impl std::fmt::Debug for AuthenticatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatorRegistry")
            .field("auth_types", &self.auth_types())
            .finish()
    }
}
