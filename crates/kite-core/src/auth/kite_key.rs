//! Same-account authentication.
//!
//! Processes run by the same operator trust each other without a token from
//! Kontrol: a peer is accepted when the username it claims equals the local
//! node's username.

use super::{AuthRequest, Authenticator};
use crate::identity::PeerIdentity;
use crate::{KiteError, Result};

#[derive(Debug, Clone)]
pub struct SameAccountAuthenticator {
    username: String,
}

impl SameAccountAuthenticator {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

impl Authenticator for SameAccountAuthenticator {
    fn authenticate(&self, request: &AuthRequest<'_>) -> Result<PeerIdentity> {
        let claimed = &request.claimed.username;
        if claimed.is_empty() {
            return Err(KiteError::rejected("username is missing"));
        }
        if *claimed != self.username {
            return Err(KiteError::rejected(format!(
                "username {:?} does not match local account",
                claimed
            )));
        }
        Ok(request.claimed.clone())
    }
}
