//! Kontrol token authentication.
//!
//! Kontrol issues RS256 JWTs. The issuer (`iss`) selects which trusted public
//! key verifies the signature, `sub` is the username the token was issued to
//! and `aud`, when present, is a key path query naming the kites the token is
//! valid for.
//!
//! # Algorithm
//!
//! 1. Decode the claims without trusting them and read `iss`
//! 2. Look up the issuer in the trust store; unknown issuers are rejected
//!    whatever the signature says
//! 3. Verify the signature with that key, and `exp`
//! 4. Check `sub` against the claimed username and `aud` against this node

use super::{AuthRequest, Authenticator};
use crate::identity::{KiteIdentity, PeerIdentity};
use crate::trust::TrustStore;
use crate::{KiteError, Result};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const ACCEPTED_ALGORITHMS: [Algorithm; 3] = [Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];

/// Claims carried by a Kontrol token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenClaims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

/// Verifies Kontrol tokens against the keys in a [`TrustStore`].
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    trust: Arc<TrustStore>,
    local: Arc<KiteIdentity>,
}

impl TokenAuthenticator {
    pub fn new(trust: Arc<TrustStore>, local: Arc<KiteIdentity>) -> Self {
        Self { trust, local }
    }

    /// Read the claims without checking the signature. Only used to find the
    /// issuer; nothing read here is trusted.
    fn peek_claims(token: &str) -> Result<TokenClaims> {
        let header = decode_header(token)
            .map_err(|e| KiteError::rejected(format!("malformed token: {}", e)))?;

        let mut insecure = Validation::new(header.alg);
        insecure.insecure_disable_signature_validation();
        insecure.validate_exp = false;
        insecure.validate_aud = false;
        insecure.required_spec_claims.clear();

        decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &insecure)
            .map(|data| data.claims)
            .map_err(|e| KiteError::rejected(format!("malformed token: {}", e)))
    }

    fn verify(&self, token: &str, issuer: &str, public_key: &str) -> Result<TokenClaims> {
        let key = DecodingKey::from_rsa_pem(public_key.as_bytes()).map_err(|e| {
            KiteError::rejected(format!("invalid public key for issuer {}: {}", issuer, e))
        })?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.algorithms = ACCEPTED_ALGORITHMS.to_vec();
        validation.validate_aud = false;
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        decode::<TokenClaims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| KiteError::rejected(format!("invalid token: {}", e)))
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, request: &AuthRequest<'_>) -> Result<PeerIdentity> {
        let token = request.credential.key.trim();
        if token.is_empty() {
            return Err(KiteError::rejected("token is missing"));
        }

        let issuer = Self::peek_claims(token)?
            .iss
            .filter(|iss| !iss.is_empty())
            .ok_or_else(|| KiteError::rejected("token does not contain a valid issuer claim"))?;

        let public_key = self
            .trust
            .lookup(&issuer)
            .ok_or_else(|| KiteError::rejected(format!("issuer is not trusted: {}", issuer)))?;

        let claims = self.verify(token, &issuer, &public_key)?;

        let subject = claims.sub.unwrap_or_default();
        if subject != request.claimed.username {
            return Err(KiteError::rejected(format!(
                "token subject {:?} does not match claimed username {:?}",
                subject, request.claimed.username
            )));
        }

        if let Some(audience) = claims.aud.as_deref() {
            if !self.local.matches_query(audience) {
                return Err(KiteError::rejected(format!(
                    "token audience {:?} does not include {}",
                    audience, self.local
                )));
            }
        }

        let mut peer = request.claimed.clone();
        peer.username = subject;
        Ok(peer)
    }
}
