//! Shared helpers for kite-core integration tests.

#![allow(dead_code)]

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use kite_core::protocol::{read_frame, write_frame, CallOptions, Envelope};
use kite_core::{Authentication, KiteConfig, KiteIdentity, Node, TokenClaims};
use serde_json::Value;
use std::time::Duration;
use tokio::io::DuplexStream;

pub const KONTROL_PRIVATE: &str = include_str!("../fixtures/kontrol_private.pem");
pub const KONTROL_PUBLIC: &str = include_str!("../fixtures/kontrol_public.pem");
pub const ROGUE_PRIVATE: &str = include_str!("../fixtures/rogue_private.pem");
pub const ROGUE_PUBLIC: &str = include_str!("../fixtures/rogue_public.pem");

pub const WAIT: Duration = Duration::from_secs(5);

pub fn config(username: &str) -> KiteConfig {
    KiteConfig {
        username: username.to_string(),
        environment: "production".to_string(),
        region: "eu".to_string(),
        ..KiteConfig::default()
    }
}

pub fn identity(name: &str, username: &str) -> KiteIdentity {
    KiteIdentity::new(name, "1.0.0", &config(username), Some("testhost".to_string()))
        .expect("valid identity")
}

pub fn node(name: &str, username: &str) -> Node {
    Node::with_identity(identity(name, username), config(username))
}

pub fn node_with_config(name: &str, config: KiteConfig) -> Node {
    let identity = KiteIdentity::new(name, "1.0.0", &config, Some("testhost".to_string()))
        .expect("valid identity");
    Node::with_identity(identity, config)
}

/// The server every scenario test talks to: "auth" 1.0.0 trusting kontrol.
pub fn auth_node() -> Node {
    let node = node("auth", "ops");
    node.trust_issuer("kontrol", KONTROL_PUBLIC);
    node
}

pub fn sign_token(issuer: &str, subject: &str, audience: Option<&str>, private_pem: &str) -> String {
    let now = chrono::Utc::now().timestamp() as u64;
    let claims = TokenClaims {
        iss: Some(issuer.to_string()),
        sub: Some(subject.to_string()),
        aud: audience.map(str::to_string),
        exp: Some(now + 3600),
        iat: Some(now),
        jti: Some(uuid::Uuid::new_v4().to_string()),
    };
    let key = EncodingKey::from_rsa_pem(private_pem.as_bytes()).expect("valid private key");
    encode(&Header::new(Algorithm::RS256), &claims, &key).expect("signed token")
}

/// Claimed identity of a raw test client.
pub fn caller(username: &str) -> KiteIdentity {
    KiteIdentity {
        username: username.to_string(),
        environment: "production".to_string(),
        name: "client".to_string(),
        version: "1.0.0".to_string(),
        ..KiteIdentity::default()
    }
}

pub fn options(kite: KiteIdentity, authentication: Option<Authentication>, args: Value) -> CallOptions {
    CallOptions {
        kite,
        authentication,
        with_args: args,
    }
}

pub fn request(id: u64, method: &str, opts: &CallOptions) -> Value {
    serde_json::to_value(Envelope::request(id, method, opts).expect("request")).expect("json")
}

pub fn notification(method: &str, opts: &CallOptions) -> Value {
    serde_json::to_value(Envelope::notification(method, opts).expect("notification")).expect("json")
}

pub async fn send(stream: &mut DuplexStream, message: &Value) {
    let bytes = serde_json::to_vec(message).expect("json");
    write_frame(stream, &bytes).await.expect("write frame");
}

pub async fn send_bytes(stream: &mut DuplexStream, bytes: &[u8]) {
    write_frame(stream, bytes).await.expect("write frame");
}

/// Next envelope from the session, or `None` on EOF.
pub async fn recv(stream: &mut DuplexStream) -> Option<Value> {
    let frame = tokio::time::timeout(WAIT, read_frame(stream))
        .await
        .expect("timed out waiting for a frame")
        .expect("read frame")?;
    Some(serde_json::from_slice(&frame).expect("valid json"))
}

/// Assert nothing arrives within `window`.
pub async fn expect_silence(stream: &mut DuplexStream, window: Duration) {
    if let Ok(result) = tokio::time::timeout(window, read_frame(stream)).await {
        panic!("expected no frame, got: {:?}", result);
    }
}

/// Poll `condition` until it holds or the wait limit passes.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
