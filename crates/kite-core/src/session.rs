//! One Kite session per connection.
//!
//! A session is both ends of an RPC channel at once: its read loop serves
//! calls from the peer, and [`Session::call`] sends calls to the peer over the
//! same stream. Responses to those outbound calls come back through the read
//! loop and are routed by correlation id.
//!
//! # States
//!
//! ```text
//! Connecting -> Unidentified -> Identified
//!      \             |              |
//!       `------------+--------------+--> Closed
//! ```
//!
//! - Every request received while `Unidentified` is authenticated before any
//!   handler runs. A failed attempt fails that request only.
//! - The first successful authentication moves the session to `Identified`
//!   exactly once and fires the first-request hooks before the handler runs.
//! - `Closed` is terminal. Pending outbound calls resolve with
//!   `ConnectionClosed` and disconnect hooks fire, both exactly once, however
//!   many paths race to close. Disconnect hooks never run before the connect
//!   hooks of the same session.
//!
//! # Thread Safety
//!
//! `Session` is a cheap `Arc` handle. The in-flight table and the closed flag
//! share one mutex so a call can never be registered after close drained the
//! table. The write half sits behind a tokio `Mutex` because both the read
//! loop (responses) and callers (requests) write.

use crate::auth::{AuthRequest, Authentication, AuthenticatorRegistry};
use crate::handler::{HandlerRegistry, Request};
use crate::hooks::{HookBus, HookEvent};
use crate::identity::{KiteIdentity, PeerIdentity};
use crate::protocol::{read_frame, write_frame, CallOptions, Envelope, Message, RpcError};
use crate::{KiteError, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Unidentified,
    Identified,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "CONNECTING"),
            SessionState::Unidentified => write!(f, "UNIDENTIFIED"),
            SessionState::Identified => write!(f, "IDENTIFIED"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Authentication policy applied to inbound calls.
#[derive(Debug, Clone, Default)]
pub struct SessionPolicy {
    /// Trust the identity a peer claims without running any authenticator.
    pub disable_authentication: bool,
    /// Close the session after this many failed authentication attempts.
    pub max_auth_failures: Option<u32>,
}

/// Shared components every session of a node dispatches through.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub local: Arc<KiteIdentity>,
    pub handlers: Arc<HandlerRegistry>,
    pub authenticators: Arc<AuthenticatorRegistry>,
    pub hooks: Arc<HookBus>,
    pub policy: SessionPolicy,
}

struct PendingSlot {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct InFlight {
    closed: bool,
    /// The read loop has started.
    started: bool,
    /// Connect hooks have finished firing.
    connect_fired: bool,
    calls: HashMap<u64, PendingSlot>,
}

struct SessionInner {
    id: String,
    remote_addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    ctx: SessionContext,
    state: Mutex<SessionState>,
    peer: RwLock<Option<PeerIdentity>>,
    credential: RwLock<Option<Authentication>>,
    auth_failures: AtomicU32,
    next_id: AtomicU64,
    in_flight: Mutex<InFlight>,
    writer: tokio::sync::Mutex<Option<BoxWriter>>,
    shutdown: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a live (or closed) session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Wrap an already-established duplex stream.
    ///
    /// Returns the session handle and its read loop. Nothing is read until the
    /// loop is run; [`Session::spawn`] does both steps.
    pub fn new<S>(stream: S, remote_addr: Option<SocketAddr>, ctx: SessionContext) -> (Session, ReadLoop)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let session = Session {
            inner: Arc::new(SessionInner {
                id: uuid::Uuid::new_v4().to_string(),
                remote_addr,
                connected_at: Utc::now(),
                ctx,
                state: Mutex::new(SessionState::Connecting),
                peer: RwLock::new(None),
                credential: RwLock::new(None),
                auth_failures: AtomicU32::new(0),
                next_id: AtomicU64::new(1),
                in_flight: Mutex::new(InFlight::default()),
                writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
                shutdown,
            }),
        };

        let read_loop = ReadLoop {
            session: session.clone(),
            reader: Box::new(reader),
            shutdown: shutdown_rx,
        };

        (session, read_loop)
    }

    /// Wrap `stream` and run its read loop on a new task.
    pub fn spawn<S>(stream: S, remote_addr: Option<SocketAddr>, ctx: SessionContext) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (session, read_loop) = Session::new(stream, remote_addr, ctx);
        tokio::spawn(read_loop.run());
        session
    }

    // ========================================
    // Accessors
    // ========================================

    /// Unique id of this session, for logs.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    /// Identity of the local node this session belongs to.
    pub fn local(&self) -> &KiteIdentity {
        &self.inner.ctx.local
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    pub fn is_identified(&self) -> bool {
        self.peer().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Verified identity of the peer, once the session is identified.
    pub fn peer(&self) -> Option<PeerIdentity> {
        self.inner
            .peer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Failed authentication attempts seen so far.
    pub fn auth_failures(&self) -> u32 {
        self.inner.auth_failures.load(Ordering::Relaxed)
    }

    /// Number of outbound calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.in_flight).calls.len()
    }

    /// Credential presented to the peer on outbound calls.
    pub fn set_authentication(&self, credential: Option<Authentication>) {
        *self
            .inner
            .credential
            .write()
            .unwrap_or_else(PoisonError::into_inner) = credential;
    }

    fn credential(&self) -> Option<Authentication> {
        self.inner
            .credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ========================================
    // Outbound calls
    // ========================================

    fn call_options(&self, args: Value) -> CallOptions {
        CallOptions {
            kite: (*self.inner.ctx.local).clone(),
            authentication: self.credential(),
            with_args: args,
        }
    }

    /// Send a request to the peer.
    ///
    /// The returned [`PendingCall`] resolves exactly once: with the peer's
    /// result or error, or with `ConnectionClosed` if the session closes
    /// first. Do not await it from inside a handler running on this same
    /// session; spawn instead.
    pub async fn call(&self, method: &str, args: Value) -> Result<PendingCall> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::request(id, method, &self.call_options(args))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut in_flight = lock(&self.inner.in_flight);
            if in_flight.closed {
                return Err(KiteError::ConnectionClosed);
            }
            in_flight.calls.insert(
                id,
                PendingSlot {
                    method: method.to_string(),
                    tx,
                },
            );
        }

        debug!("Session {} call #{} {}", self.inner.id, id, method);

        if let Err(e) = self.send(&envelope).await {
            self.cancel_call(id);
            return Err(e);
        }

        Ok(PendingCall { id, rx })
    }

    /// Call `method` and wait for its result.
    pub async fn tell(&self, method: &str, args: Value) -> Result<Value> {
        self.call(method, args).await?.await
    }

    /// Like [`tell`](Self::tell), giving up after `timeout`. The pending slot
    /// is released on timeout; a late response is then dropped as unmatched.
    pub async fn tell_with_timeout(&self, method: &str, timeout: Duration, args: Value) -> Result<Value> {
        let pending = self.call(method, args).await?;
        let id = pending.id();

        match tokio::time::timeout(timeout, pending).await {
            Ok(result) => result,
            Err(_) => {
                self.cancel_call(id);
                Err(KiteError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Send a notification: no correlation id, no response.
    pub async fn notify(&self, method: &str, args: Value) -> Result<()> {
        let envelope = Envelope::notification(method, &self.call_options(args))?;
        self.send(&envelope).await
    }

    /// Drop the pending slot for `id`. Returns false if it was already
    /// resolved or released.
    pub fn cancel_call(&self, id: u64) -> bool {
        lock(&self.inner.in_flight).calls.remove(&id).is_some()
    }

    /// Deliver `outcome` to the pending call `id`.
    fn resolve(&self, id: &Value, outcome: Result<Value>) -> Result<()> {
        let unmatched = || KiteError::UnmatchedResponse { id: id.to_string() };
        let key = id.as_u64().ok_or_else(unmatched)?;
        let slot = lock(&self.inner.in_flight)
            .calls
            .remove(&key)
            .ok_or_else(unmatched)?;

        debug!("Session {} response #{} for {}", self.inner.id, key, slot.method);
        // The caller may have stopped waiting; that is not an error here.
        let _ = slot.tx.send(outcome);
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let payload = serde_json::to_vec(envelope)?;

        // A peer that stopped reading must not pin the writer after close.
        let write = async {
            let mut writer = self.inner.writer.lock().await;
            match writer.as_mut() {
                Some(stream) => write_frame(stream, &payload).await,
                None => Err(KiteError::ConnectionClosed),
            }
        };
        let result = tokio::select! {
            result = write => result,
            _ = self.closed() => Err(KiteError::ConnectionClosed),
        };

        match result {
            Err(e @ KiteError::Io { .. }) => {
                debug!("Session {} write failed: {}", self.inner.id, e);
                self.close();
                Err(KiteError::ConnectionClosed)
            }
            other => other,
        }
    }

    // ========================================
    // Close
    // ========================================

    /// Close the session. Idempotent; only the first call has any effect.
    pub fn close(&self) {
        let (drained, fire_disconnect) = {
            let mut in_flight = lock(&self.inner.in_flight);
            if in_flight.closed {
                return;
            }
            in_flight.closed = true;
            // While connect hooks are still running, the read loop fires
            // disconnect once they are done.
            let fire = in_flight.connect_fired || !in_flight.started;
            (std::mem::take(&mut in_flight.calls), fire)
        };

        *lock(&self.inner.state) = SessionState::Closed;

        for (_, slot) in drained {
            let _ = slot.tx.send(Err(KiteError::ConnectionClosed));
        }

        self.inner.shutdown.send_replace(true);

        match self.peer() {
            Some(peer) => info!("Session {} with {} closed", self.inner.id, peer),
            None => info!("Session {} closed before identification", self.inner.id),
        }

        if fire_disconnect {
            self.inner.ctx.hooks.fire(HookEvent::Disconnect, self);
        }
    }

    /// Wait until the session is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.shutdown.subscribe();
        // Err means the sender is gone, which only happens with the session itself.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn shutdown_writer(&self) {
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    // ========================================
    // Inbound
    // ========================================

    async fn process_frame(&self, frame: Vec<u8>) {
        let envelope: Envelope = match serde_json::from_slice(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Session {} sent invalid JSON: {}", self.inner.id, e);
                let error = RpcError {
                    code: -32700,
                    message: format!("Parse error: {}", e),
                    data: None,
                };
                self.reply(Envelope::error(None, error)).await;
                return;
            }
        };

        // Only envelopes that asked for an answer get one; replying to a bad
        // response could start an error ping-pong between the two peers.
        let reply_id = envelope
            .method
            .as_ref()
            .and(envelope.id.clone())
            .filter(|id| !id.is_null());

        let message = match envelope.classify() {
            Ok(message) => message,
            Err(e) => {
                warn!("Session {} dropped envelope: {}", self.inner.id, e);
                if let Some(id) = reply_id {
                    let error = RpcError {
                        code: -32600,
                        message: format!("Invalid Request: {}", e),
                        data: None,
                    };
                    self.reply(Envelope::error(Some(id), error)).await;
                }
                return;
            }
        };

        match message {
            Message::Request { id, method, params } => {
                let envelope = match self.handle_call(method, params).await {
                    Ok(result) => Envelope::success(id.clone(), result),
                    Err(e) => Envelope::error(Some(id.clone()), RpcError::from(&e)),
                };
                match self.send(&envelope).await {
                    Ok(()) => {}
                    // Unencodable or oversized: the caller still gets an answer.
                    Err(e @ (KiteError::Protocol { .. } | KiteError::Json { .. })) => {
                        warn!("Session {} could not send reply {}: {}", self.inner.id, id, e);
                        let error = RpcError {
                            code: -32603,
                            message: format!("Internal error: reply not sent: {}", e),
                            data: None,
                        };
                        self.reply(Envelope::error(Some(id), error)).await;
                    }
                    Err(e) => debug!("Session {} could not send reply: {}", self.inner.id, e),
                }
                self.close_if_locked_out();
            }
            Message::Notification { method, params } => {
                if let Err(e) = self.handle_call(method.clone(), params).await {
                    debug!("Session {} notification {} failed: {}", self.inner.id, method, e);
                }
                self.close_if_locked_out();
            }
            Message::Response { id, outcome } => {
                let outcome = outcome.map_err(|e| KiteError::Remote {
                    code: e.code,
                    message: e.message,
                });
                if let Err(e) = self.resolve(&id, outcome) {
                    warn!("Session {}: {}", self.inner.id, e);
                }
            }
        }
    }

    async fn reply(&self, envelope: Envelope) {
        if let Err(e) = self.send(&envelope).await {
            debug!("Session {} could not send reply: {}", self.inner.id, e);
        }
    }

    /// Authenticate if needed, then dispatch.
    async fn handle_call(&self, method: String, params: Value) -> Result<Value> {
        let options: CallOptions =
            serde_json::from_value(params).map_err(|e| KiteError::InvalidParams {
                message: format!("{}: {}", method, e),
            })?;

        let peer = self.identify(&options)?;

        debug!("Session {} dispatching {}", self.inner.id, method);
        let request = Request {
            method,
            args: options.with_args,
            peer,
            session: self.clone(),
        };
        let result = self.inner.ctx.handlers.dispatch(request).await;
        if let Err(e) = &result {
            debug!("Session {} dispatch failed: {}", self.inner.id, e);
        }
        result
    }

    /// Return the verified peer, authenticating first if the session is not
    /// identified yet.
    fn identify(&self, options: &CallOptions) -> Result<PeerIdentity> {
        if let Some(peer) = self.peer() {
            return Ok(peer);
        }

        match self.authenticate(options) {
            Ok(peer) => self.mark_identified(peer),
            Err(e) => {
                let failures = self.inner.auth_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Session {} authentication failed (attempt {}): {}",
                    self.inner.id, failures, e
                );
                Err(e)
            }
        }
    }

    /// Close an unidentified session that used up its authentication
    /// attempts. Runs after the failing call was answered.
    fn close_if_locked_out(&self) {
        if let Some(max) = self.inner.ctx.policy.max_auth_failures {
            if !self.is_identified() && self.auth_failures() >= max {
                warn!(
                    "Session {} reached {} failed authentication attempts, closing",
                    self.inner.id, max
                );
                self.close();
            }
        }
    }

    fn authenticate(&self, options: &CallOptions) -> Result<PeerIdentity> {
        if self.inner.ctx.policy.disable_authentication {
            return Ok(options.kite.clone());
        }

        let credential = options
            .authentication
            .as_ref()
            .ok_or_else(|| KiteError::rejected("no authentication supplied"))?;

        self.inner.ctx.authenticators.authenticate(
            &credential.auth_type,
            &AuthRequest {
                claimed: &options.kite,
                credential,
            },
        )
    }

    /// `Unidentified -> Identified`, exactly once.
    fn mark_identified(&self, peer: PeerIdentity) -> Result<PeerIdentity> {
        {
            let mut state = lock(&self.inner.state);
            let current = *state;
            match current {
                SessionState::Closed => return Err(KiteError::ConnectionClosed),
                SessionState::Identified => {
                    drop(state);
                    return self.peer().ok_or(KiteError::ConnectionClosed);
                }
                SessionState::Connecting | SessionState::Unidentified => {
                    *self
                        .inner
                        .peer
                        .write()
                        .unwrap_or_else(PoisonError::into_inner) = Some(peer.clone());
                    *state = SessionState::Identified;
                }
            }
        }

        info!("Session {} identified as {}", self.inner.id, peer);
        self.inner.ctx.hooks.fire(HookEvent::FirstRequest, self);
        Ok(peer)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .field("peer", &self.peer().map(|p| p.key_path()))
            .finish()
    }
}

/// An outbound call waiting for its response.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingCall {
    /// Correlation id of this call.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Slot dropped without an answer: cancelled or session gone.
            Poll::Ready(Err(_)) => Poll::Ready(Err(KiteError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The read side of a session. Runs until the peer disconnects, the stream
/// fails, or the session is closed locally.
pub struct ReadLoop {
    session: Session,
    reader: BoxReader,
    shutdown: watch::Receiver<bool>,
}

impl ReadLoop {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn run(mut self) {
        let session = self.session.clone();

        let closed_early = {
            let mut in_flight = lock(&session.inner.in_flight);
            in_flight.started = true;
            in_flight.closed
        };
        if closed_early {
            session.shutdown_writer().await;
            return;
        }

        {
            let mut state = lock(&session.inner.state);
            if *state == SessionState::Connecting {
                *state = SessionState::Unidentified;
            }
        }

        match session.remote_addr() {
            Some(addr) => info!("New connection from: {} (session {})", addr, session.id()),
            None => info!("New session {}", session.id()),
        }
        session.inner.ctx.hooks.fire(HookEvent::Connect, &session);

        let closed_during_connect = {
            let mut in_flight = lock(&session.inner.in_flight);
            in_flight.connect_fired = true;
            in_flight.closed
        };
        if closed_during_connect {
            session.inner.ctx.hooks.fire(HookEvent::Disconnect, &session);
        }

        let reason = loop {
            if *self.shutdown.borrow() {
                break "closed locally".to_string();
            }

            let frame = tokio::select! {
                result = read_frame(&mut self.reader) => match result {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break "peer disconnected".to_string(),
                    Err(e) => break e.to_string(),
                },
                _ = self.shutdown.changed() => break "closed locally".to_string(),
            };

            session.process_frame(frame).await;
        };

        debug!("Session {} read loop exiting: {}", session.id(), reason);
        session.close();
        session.shutdown_writer().await;
    }
}
