//! Trusted Kontrol keys.
//!
//! Kontrol signs the access tokens it issues with a private key. A node
//! accepts those tokens only if the issuer's public key was registered here
//! explicitly; nothing is trusted by default.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Mapping from token issuer to PEM encoded public key.
///
/// Grows only through [`TrustStore::trust`]; there is no removal. Reads take a
/// shared lock so verification on many sessions can run concurrently with an
/// occasional registration.
#[derive(Debug, Default)]
pub struct TrustStore {
    keys: RwLock<HashMap<String, String>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust `public_key` for tokens issued by `issuer`. Replaces any previous
    /// key for the same issuer.
    pub fn trust(&self, issuer: impl Into<String>, public_key: impl Into<String>) {
        let issuer = issuer.into();
        debug!("Trusting Kontrol key for issuer {:?}", issuer);
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(issuer, public_key.into());
    }

    /// Public key for `issuer`, exact match.
    pub fn lookup(&self, issuer: &str) -> Option<String> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(issuer)
            .cloned()
    }

    /// Trusted issuers, sorted.
    pub fn issuers(&self) -> Vec<String> {
        let mut issuers: Vec<String> = self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        issuers.sort();
        issuers
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
