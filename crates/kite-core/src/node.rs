//! Node: the process-level entry point.
//!
//! A `Node` owns the identity of this process and the registries every session
//! shares (trust store, authenticators, handlers, hooks). It turns connections
//! into sessions, either ones it accepts from a TCP listener or ones it dials.
//!
//! Configure handlers, authenticators and hooks before serving. Once the first
//! session starts, the reserved `kite.*` methods are locked.

use crate::auth::{
    Authentication, Authenticator, AuthenticatorRegistry, SameAccountAuthenticator,
    TokenAuthenticator, KITE_KEY_AUTH_TYPE, TOKEN_AUTH_TYPE,
};
use crate::config::{KiteConfig, ProtocolConfig};
use crate::handler::{self, handler_fn, Handler, HandlerRegistry, Request};
use crate::hooks::HookBus;
use crate::identity::{resolve_hostname, KiteIdentity};
use crate::session::{Session, SessionContext, SessionPolicy};
use crate::trust::TrustStore;
use crate::{KiteError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Live sessions by session id.
#[derive(Default)]
struct SessionTable {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionTable {
    fn insert(&self, session: &Session) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id().to_string(), session.clone());
    }

    fn remove(&self, session: &Session) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session.id());
    }

    fn snapshot(&self) -> Vec<Session> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn close_all(&self) {
        for session in self.snapshot() {
            session.close();
        }
    }
}

/// A Kite peer process.
pub struct Node {
    identity: Arc<KiteIdentity>,
    config: KiteConfig,
    trust: Arc<TrustStore>,
    authenticators: Arc<AuthenticatorRegistry>,
    handlers: Arc<HandlerRegistry>,
    hooks: Arc<HookBus>,
    sessions: Arc<SessionTable>,
}

impl Node {
    /// Create a node named `name` at `version`.
    ///
    /// Fails with `Config` when the name is empty, the version is not a plain
    /// `MAJOR.MINOR.PATCH` or the hostname cannot be resolved.
    pub fn new(name: &str, version: &str, config: KiteConfig) -> Result<Self> {
        let identity = KiteIdentity::new(name, version, &config, resolve_hostname())?;
        Ok(Self::with_identity(identity, config))
    }

    /// Create a node around an identity built by the caller.
    pub fn with_identity(identity: KiteIdentity, config: KiteConfig) -> Self {
        let identity = Arc::new(identity);

        let trust = Arc::new(TrustStore::new());
        for (issuer, key) in config.bootstrap_keys() {
            trust.trust(issuer, key);
        }

        let authenticators = Arc::new(AuthenticatorRegistry::new());
        authenticators.register(
            TOKEN_AUTH_TYPE,
            Arc::new(TokenAuthenticator::new(trust.clone(), identity.clone())),
        );
        authenticators.register(
            KITE_KEY_AUTH_TYPE,
            Arc::new(SameAccountAuthenticator::new(identity.username.clone())),
        );

        let handlers = Arc::new(HandlerRegistry::new());
        handler::register_defaults(&handlers, identity.clone());

        let hooks = Arc::new(HookBus::new());
        let sessions = Arc::new(SessionTable::default());

        // Session tracking. Weak so sessions holding the hook bus do not keep
        // the table alive.
        let table: Weak<SessionTable> = Arc::downgrade(&sessions);
        hooks.on_connect(move |session| {
            if let Some(table) = table.upgrade() {
                table.insert(session);
            }
            Ok(())
        });
        let table: Weak<SessionTable> = Arc::downgrade(&sessions);
        hooks.on_disconnect(move |session| {
            if let Some(table) = table.upgrade() {
                table.remove(session);
            }
            Ok(())
        });

        info!("Created kite {}", identity);

        Self {
            identity,
            config,
            trust,
            authenticators,
            handlers,
            hooks,
            sessions,
        }
    }

    // ========================================
    // Configuration
    // ========================================

    /// Descriptor of this node.
    pub fn kite(&self) -> &KiteIdentity {
        &self.identity
    }

    pub fn config(&self) -> &KiteConfig {
        &self.config
    }

    /// Trust `public_key` (PEM) for tokens issued by `issuer`.
    pub fn trust_issuer(&self, issuer: impl Into<String>, public_key: impl Into<String>) {
        self.trust.trust(issuer, public_key);
    }

    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// Register a handler for `method`.
    pub fn handle(&self, method: impl Into<String>, handler: Arc<dyn Handler>) -> Result<()> {
        self.handlers.register(method, handler)
    }

    /// Register a synchronous closure for `method`.
    pub fn handle_func<F>(&self, method: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(&Request) -> Result<Value> + Send + Sync + 'static,
    {
        self.handlers.register(method, handler_fn(f))
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        self.handlers.methods()
    }

    /// Register an authentication strategy for `auth_type`, replacing any
    /// earlier one, built-ins included.
    pub fn register_authenticator(&self, auth_type: impl Into<String>, strategy: Arc<dyn Authenticator>) {
        self.authenticators.register(auth_type, strategy);
    }

    pub fn on_connect<F>(&self, hook: F)
    where
        F: Fn(&Session) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_connect(hook);
    }

    pub fn on_first_request<F>(&self, hook: F)
    where
        F: Fn(&Session) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_first_request(hook);
    }

    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn(&Session) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_disconnect(hook);
    }

    /// Sessions that are connected right now.
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.snapshot()
    }

    fn context(&self) -> SessionContext {
        SessionContext {
            local: self.identity.clone(),
            handlers: self.handlers.clone(),
            authenticators: self.authenticators.clone(),
            hooks: self.hooks.clone(),
            policy: SessionPolicy {
                disable_authentication: self.config.disable_authentication,
                max_auth_failures: self.config.max_auth_failures,
            },
        }
    }

    // ========================================
    // Serving
    // ========================================

    /// Serve an already-established stream. Connect hooks fire when the
    /// session's read loop starts.
    pub fn accept<S>(&self, stream: S, remote_addr: Option<SocketAddr>) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.handlers.seal();
        Session::spawn(stream, remote_addr, self.context())
    }

    /// Connect to the node at `addr`. Outbound calls on the returned session
    /// present `authentication`.
    pub async fn dial<A>(&self, addr: A, authentication: Option<Authentication>) -> Result<Session>
    where
        A: ToSocketAddrs + fmt::Display,
    {
        let target = addr.to_string();
        let stream = tokio::time::timeout(ProtocolConfig::DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| KiteError::Io {
                message: format!(
                    "Connecting to {} timed out after {:?}",
                    target,
                    ProtocolConfig::DIAL_TIMEOUT
                ),
                source: None,
            })?
            .map_err(|e| KiteError::Io {
                message: format!("Failed to connect to {}: {}", target, e),
                source: Some(e),
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", target, e);
        }
        let peer_addr = stream.peer_addr().ok();

        self.handlers.seal();
        let (session, read_loop) = Session::new(stream, peer_addr, self.context());
        session.set_authentication(authentication);
        tokio::spawn(read_loop.run());

        debug!("Dialed {} (session {})", target, session.id());
        Ok(session)
    }

    /// Bind a TCP listener on `addr` and serve every connection on it.
    ///
    /// Returns a handle that reports the bound address and shuts the server
    /// down when dropped. Shutdown closes the sessions this listener accepted
    /// and leaves every other session of the node alone.
    pub async fn listen<A: ToSocketAddrs>(&self, addr: A) -> Result<NodeServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        self.handlers.seal();
        info!("Kite {} listening on {}", self.identity.name, addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let accepted = Arc::new(SessionTable::default());

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            self.context(),
            shutdown_rx,
            accepted.clone(),
        ));

        Ok(NodeServerHandle {
            addr,
            port: addr.port(),
            shutdown_tx: Some(shutdown_tx),
            accepted,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        ctx: SessionContext,
        mut shutdown_rx: oneshot::Receiver<()>,
        accepted: Arc<SessionTable>,
    ) {
        let active_connections = Arc::new(AtomicUsize::new(0));
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Kite server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= ProtocolConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    ProtocolConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Could not set TCP_NODELAY for {}: {}", peer_addr, e);
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let conns = active_connections.clone();
                            let (session, read_loop) =
                                Session::new(stream, Some(peer_addr), ctx.clone());
                            accepted.insert(&session);
                            let accepted = accepted.clone();

                            tokio::spawn(async move {
                                read_loop.run().await;
                                accepted.remove(&session);
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }

        // Anything accepted while shutdown was in flight.
        accepted.close_all();
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("kite", &self.identity.key_path())
            .field("trusted_issuers", &self.trust.issuers())
            .field("auth_types", &self.authenticators.auth_types())
            .field("methods", &self.handlers.methods())
            .field("sessions", &self.sessions.snapshot().len())
            .finish()
    }
}

/// Handle to a listening node. Dropping shuts the server down.
pub struct NodeServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    accepted: Arc<SessionTable>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl NodeServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of live sessions accepted by this listener.
    pub fn session_count(&self) -> usize {
        self.accepted.snapshot().len()
    }

    /// Stop accepting connections and close the sessions this listener
    /// accepted.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.accepted.close_all();
    }
}

impl Drop for NodeServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}
