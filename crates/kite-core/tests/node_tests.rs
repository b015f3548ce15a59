//! Node tests over real TCP connections with Kontrol-style tokens.

mod common;

use common::*;
use kite_core::{AuthRequest, Authentication, KiteError, PeerIdentity, SessionState};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn alice_token(private_pem: &str) -> Option<Authentication> {
    Some(Authentication::token(sign_token("kontrol", "alice", None, private_pem)))
}

fn remote_code(result: kite_core::Result<Value>) -> i32 {
    match result {
        Err(KiteError::Remote { code, .. }) => code,
        other => panic!("Expected remote error, got: {:?}", other),
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_trusted_token_identifies_session() {
    let server = auth_node();
    let first_requests = Arc::new(Mutex::new(Vec::new()));
    let seen = first_requests.clone();
    server.on_first_request(move |session| {
        let peer = session.peer().expect("identified before first-request hooks");
        seen.lock().unwrap().push(peer.username);
        Ok(())
    });
    server
        .handle_func("square", |req| {
            let n: i64 = req.args()?;
            Ok(json!(n * n))
        })
        .unwrap();
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    let client = node("client", "alice");
    let session = client
        .dial(handle.addr(), alice_token(KONTROL_PRIVATE))
        .await
        .unwrap();

    assert_eq!(session.tell("square", json!(4)).await.unwrap(), json!(16));
    assert_eq!(session.tell("square", json!(5)).await.unwrap(), json!(25));

    assert_eq!(*first_requests.lock().unwrap(), vec!["alice".to_string()]);

    let served = server.sessions();
    assert_eq!(served.len(), 1);
    assert_eq!(served[0].state(), SessionState::Identified);
    assert_eq!(served[0].peer().unwrap().name, "client");
}

#[tokio::test]
async fn test_token_from_untrusted_key_is_rejected_and_connection_stays() {
    let server = auth_node();
    let first_requests = Arc::new(AtomicUsize::new(0));
    let f = first_requests.clone();
    server.on_first_request(move |_| {
        f.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    let client = node("client", "alice");
    let session = client
        .dial(handle.addr(), alice_token(ROGUE_PRIVATE))
        .await
        .unwrap();

    assert_eq!(remote_code(session.tell("kite.ping", Value::Null).await), -32001);
    assert_eq!(first_requests.load(Ordering::SeqCst), 0);

    let served = server.sessions();
    assert_eq!(served.len(), 1);
    assert_eq!(served[0].state(), SessionState::Unidentified);
    assert!(!session.is_closed());

    // Same connection, good credential this time.
    session.set_authentication(alice_token(KONTROL_PRIVATE));
    assert_eq!(session.tell("kite.ping", Value::Null).await.unwrap(), json!("pong"));
    assert_eq!(first_requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_trust_issuer_at_runtime() {
    let server = node("auth", "ops");
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    let client = node("client", "alice");
    let session = client
        .dial(handle.addr(), alice_token(KONTROL_PRIVATE))
        .await
        .unwrap();

    match session.tell("kite.ping", Value::Null).await {
        Err(KiteError::Remote { code, message }) => {
            assert_eq!(code, -32001);
            assert!(message.contains("issuer is not trusted: kontrol"));
        }
        other => panic!("Expected rejection, got: {:?}", other),
    }

    server.trust_issuer("kontrol", KONTROL_PUBLIC);
    assert_eq!(session.tell("kite.ping", Value::Null).await.unwrap(), json!("pong"));
}

#[tokio::test]
async fn test_token_audience() {
    let server = auth_node();
    let handle = server.listen("127.0.0.1:0").await.unwrap();
    let client = node("client", "alice");

    let scoped = |aud: &str| Some(Authentication::token(sign_token("kontrol", "alice", Some(aud), KONTROL_PRIVATE)));

    let session = client.dial(handle.addr(), scoped("/ops/production/auth")).await.unwrap();
    assert_eq!(session.tell("kite.ping", Value::Null).await.unwrap(), json!("pong"));

    let session = client.dial(handle.addr(), scoped("/ops/production/billing")).await.unwrap();
    assert_eq!(remote_code(session.tell("kite.ping", Value::Null).await), -32001);
}

#[tokio::test]
async fn test_token_subject_must_match_claimed_username() {
    let server = auth_node();
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    // Mallory presents alice's token.
    let client = node("client", "mallory");
    let session = client
        .dial(handle.addr(), alice_token(KONTROL_PRIVATE))
        .await
        .unwrap();
    assert_eq!(remote_code(session.tell("kite.ping", Value::Null).await), -32001);
}

#[tokio::test]
async fn test_later_authenticator_registration_wins() {
    let server = node("auth", "ops");
    server.register_authenticator(
        "shared",
        Arc::new(|_: &AuthRequest<'_>| -> kite_core::Result<PeerIdentity> {
            Err(KiteError::rejected("first strategy"))
        }),
    );
    server.register_authenticator(
        "shared",
        Arc::new(|req: &AuthRequest<'_>| -> kite_core::Result<PeerIdentity> {
            if req.credential.key == "open sesame" {
                Ok(req.claimed.clone())
            } else {
                Err(KiteError::rejected("wrong phrase"))
            }
        }),
    );
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    let client = node("client", "alice");
    let session = client
        .dial(handle.addr(), Some(Authentication::new("shared", "open sesame")))
        .await
        .unwrap();
    assert_eq!(session.tell("kite.ping", Value::Null).await.unwrap(), json!("pong"));
}

// ============================================================================
// Bidirectional calls
// ============================================================================

#[tokio::test]
async fn test_server_calls_back_into_client() {
    let server = auth_node();
    server
        .handle_func("subscribe", |req| {
            let session = req.session.clone();
            let topic: String = req.args()?;
            // Must not await on the read loop that is running this handler.
            tokio::spawn(async move {
                let _ = session.tell("client.event", json!({ "topic": topic })).await;
            });
            Ok(json!("subscribed"))
        })
        .unwrap();
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    // The server presents no credential, so the client trusts what it claims.
    let mut cfg = config("alice");
    cfg.disable_authentication = true;
    let client = node_with_config("client", cfg);
    let events = Arc::new(Mutex::new(Vec::new()));
    let e = events.clone();
    client
        .handle_func("client.event", move |req| {
            e.lock().unwrap().push((req.peer.name.clone(), req.args.clone()));
            Ok(Value::Null)
        })
        .unwrap();

    let session = client
        .dial(handle.addr(), alice_token(KONTROL_PRIVATE))
        .await
        .unwrap();
    assert_eq!(
        session.tell("subscribe", json!("deploys")).await.unwrap(),
        json!("subscribed")
    );

    wait_until(|| !events.lock().unwrap().is_empty()).await;
    let events = events.lock().unwrap();
    assert_eq!(events[0].0, "auth");
    assert_eq!(events[0].1, json!({"topic": "deploys"}));
}

// ============================================================================
// Default methods and lifecycle
// ============================================================================

#[tokio::test]
async fn test_default_methods_over_the_wire() {
    let server = auth_node();
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    let client = node("client", "alice");
    let session = client
        .dial(handle.addr(), alice_token(KONTROL_PRIVATE))
        .await
        .unwrap();

    let identity = session.tell("kite.identity", Value::Null).await.unwrap();
    assert_eq!(identity["name"], json!("auth"));
    assert_eq!(identity["version"], json!("1.0.0"));
    assert_eq!(identity["id"], json!(server.kite().id));

    let info = session.tell("kite.systemInfo", Value::Null).await.unwrap();
    assert_eq!(info["state"], json!("RUNNING"));
    assert_eq!(info["username"], json!("ops"));

    assert_eq!(session.tell("kite.log", json!("hello")).await.unwrap(), Value::Null);
}

#[tokio::test]
async fn test_reserved_methods_locked_after_listen() {
    let server = auth_node();
    server
        .handle_func("kite.ping", |_| Ok(json!("custom pong")))
        .unwrap();
    let handle = server.listen("127.0.0.1:0").await.unwrap();

    assert!(matches!(
        server.handle_func("kite.ping", |_| Ok(json!("too late"))),
        Err(KiteError::ReservedMethod { .. })
    ));

    let client = node("client", "alice");
    let session = client
        .dial(handle.addr(), alice_token(KONTROL_PRIVATE))
        .await
        .unwrap();
    assert_eq!(
        session.tell("kite.ping", Value::Null).await.unwrap(),
        json!("custom pong")
    );
}

#[tokio::test]
async fn test_server_shutdown_closes_sessions() {
    let server = auth_node();
    let disconnects = Arc::new(AtomicUsize::new(0));
    let d = disconnects.clone();
    server.on_disconnect(move |_| {
        d.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let mut handle = server.listen("127.0.0.1:0").await.unwrap();

    let client = node("client", "alice");
    let session = client
        .dial(handle.addr(), alice_token(KONTROL_PRIVATE))
        .await
        .unwrap();
    assert_eq!(session.tell("kite.ping", Value::Null).await.unwrap(), json!("pong"));

    handle.shutdown();

    tokio::time::timeout(WAIT, session.closed()).await.unwrap();
    assert!(matches!(
        session.tell("kite.ping", Value::Null).await,
        Err(KiteError::ConnectionClosed)
    ));
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert!(server.sessions().is_empty());
}

#[tokio::test]
async fn test_listener_shutdown_leaves_other_sessions_open() {
    let upstream = auth_node();
    let upstream_handle = upstream.listen("127.0.0.1:0").await.unwrap();

    let relay = node("relay", "alice");
    let mut relay_handle = relay.listen("127.0.0.1:0").await.unwrap();

    // The relay dials out on its own account.
    let outbound = relay
        .dial(upstream_handle.addr(), alice_token(KONTROL_PRIVATE))
        .await
        .unwrap();
    assert_eq!(outbound.tell("kite.ping", Value::Null).await.unwrap(), json!("pong"));

    let client = node("client", "alice");
    let inbound = client
        .dial(relay_handle.addr(), Some(Authentication::kite_key("")))
        .await
        .unwrap();
    assert_eq!(inbound.tell("kite.ping", Value::Null).await.unwrap(), json!("pong"));

    assert_eq!(relay_handle.session_count(), 1);
    assert_eq!(relay.sessions().len(), 2);

    relay_handle.shutdown();

    tokio::time::timeout(WAIT, inbound.closed()).await.unwrap();
    assert!(!outbound.is_closed());
    assert_eq!(outbound.tell("kite.ping", Value::Null).await.unwrap(), json!("pong"));
    wait_until(|| relay.sessions().len() == 1).await;
    assert_eq!(relay.sessions()[0].id(), outbound.id());
}
