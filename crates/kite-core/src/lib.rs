//! Kite Core - Peer session engine for Kite micro-services.
//!
//! Every Kite process is at the same time an RPC server and an RPC client.
//! Over one duplex connection both sides can call each other; the first call
//! a peer makes carries its identity and a credential, and once that is
//! verified the session is identified for the rest of its life.
//!
//! # Example
//!
//! ```rust,ignore
//! use kite_core::{Authentication, KiteConfig, Node};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> kite_core::Result<()> {
//!     let node = Node::new("math", "1.0.0", KiteConfig::load(None)?)?;
//!     node.trust_issuer("kontrol", std::fs::read_to_string("kontrol.pem")?);
//!     node.handle_func("square", |req| {
//!         let n: i64 = req.args()?;
//!         Ok(json!(n * n))
//!     })?;
//!
//!     let server = node.listen("0.0.0.0:3636").await?;
//!     println!("Serving {} on {}", node.kite(), server.addr());
//!
//!     let session = node
//!         .dial("10.0.0.7:3636", Some(Authentication::token("eyJ...")))
//!         .await?;
//!     let sixteen = session.tell("square", json!(4)).await?;
//!     println!("{}", sixteen);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod handler;
pub mod hooks;
pub mod identity;
pub mod node;
pub mod protocol;
pub mod session;
pub mod trust;

// Re-export commonly used types
pub use auth::{
    AuthRequest, Authentication, Authenticator, AuthenticatorRegistry, SameAccountAuthenticator,
    TokenAuthenticator, TokenClaims, KITE_KEY_AUTH_TYPE, TOKEN_AUTH_TYPE,
};
pub use config::{EnvConfig, KiteConfig, ProtocolConfig};
pub use error::{KiteError, Result};
pub use handler::{handler_fn, Handler, HandlerRegistry, Request};
pub use hooks::{HookBus, HookEvent};
pub use identity::{KiteIdentity, PeerIdentity};
pub use node::{Node, NodeServerHandle};
pub use session::{PendingCall, Session, SessionState};
pub use trust::TrustStore;
