//! Method handlers and the registry that dispatches to them.
//!
//! Handlers are registered by method name before the node starts serving.
//! A fixed set of `kite.*` methods is registered at construction and marked
//! reserved: they may be replaced (with a warning) until serving starts, and
//! are locked afterwards.

use crate::identity::{KiteIdentity, PeerIdentity};
use crate::session::Session;
use crate::{KiteError, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

/// An inbound call, as seen by a handler.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub args: Value,
    /// Verified identity of the calling peer.
    pub peer: PeerIdentity,
    /// Session the call arrived on. Outbound calls made through it from inside
    /// a handler must be spawned, not awaited inline: the session's read loop
    /// is busy running this handler and could never deliver the response.
    pub session: Session,
}

impl Request {
    /// Deserialize the call arguments.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.args.clone()).map_err(|e| KiteError::InvalidParams {
            message: format!("{}: {}", self.method, e),
        })
    }
}

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<Value>;
}

/// Adapter for plain synchronous closures.
struct FuncHandler<F>(F);

#[async_trait]
impl<F> Handler for FuncHandler<F>
where
    F: Fn(&Request) -> Result<Value> + Send + Sync + 'static,
{
    async fn handle(&self, request: Request) -> Result<Value> {
        (self.0)(&request)
    }
}

/// Wrap a closure as a [`Handler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(&Request) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(FuncHandler(f))
}

/// Method name → handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    reserved: RwLock<HashSet<String>>,
    serving: AtomicBool,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method`, replacing any previous handler.
    ///
    /// Replacing a reserved method is allowed before [`seal`](Self::seal) is
    /// called and logged as a warning; afterwards it fails with
    /// `ReservedMethod`.
    pub fn register(&self, method: impl Into<String>, handler: Arc<dyn Handler>) -> Result<()> {
        let method = method.into();
        if self.is_reserved(&method) {
            if self.serving.load(Ordering::Acquire) {
                return Err(KiteError::ReservedMethod { method });
            }
            warn!("Overriding default method {}", method);
        }

        debug!("Registering handler for {}", method);
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method, handler);
        Ok(())
    }

    /// Register a handler and mark the method reserved.
    pub(crate) fn register_reserved(&self, method: &str, handler: Arc<dyn Handler>) {
        self.reserved
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.to_string());
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.to_string(), handler);
    }

    /// Lock reserved methods. Called when the node starts serving.
    pub fn seal(&self) {
        self.serving.store(true, Ordering::Release);
    }

    pub fn is_reserved(&self, method: &str) -> bool {
        self.reserved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(method)
    }

    pub fn lookup(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        methods.sort();
        methods
    }

    /// Resolve and run the handler for `request.method`.
    ///
    /// Handler failures, including panics, come back as `Handler` errors so
    /// they can be sent to the caller; `InvalidParams` passes through as is.
    pub async fn dispatch(&self, request: Request) -> Result<Value> {
        let method = request.method.clone();
        let handler = self
            .lookup(&method)
            .ok_or_else(|| KiteError::MethodNotFound {
                method: method.clone(),
            })?;

        match AssertUnwindSafe(handler.handle(request)).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ KiteError::InvalidParams { .. })) => Err(e),
            Ok(Err(e)) => Err(KiteError::Handler {
                method,
                message: e.to_string(),
            }),
            Err(_) => {
                error!("Handler for {} panicked", method);
                Err(KiteError::Handler {
                    method,
                    message: "handler panicked".to_string(),
                })
            }
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("methods", &self.methods())
            .field("serving", &self.serving.load(Ordering::Relaxed))
            .finish()
    }
}

// ============================================================================
// Default methods
// ============================================================================

pub const PING_METHOD: &str = "kite.ping";
pub const IDENTITY_METHOD: &str = "kite.identity";
pub const SYSTEM_INFO_METHOD: &str = "kite.systemInfo";
pub const LOG_METHOD: &str = "kite.log";
pub const PRINT_METHOD: &str = "kite.print";

/// Register the reserved `kite.*` methods every node answers.
pub(crate) fn register_defaults(registry: &HandlerRegistry, local: Arc<KiteIdentity>) {
    registry.register_reserved(PING_METHOD, handler_fn(|_| Ok(json!("pong"))));

    let me = local.clone();
    registry.register_reserved(
        IDENTITY_METHOD,
        handler_fn(move |_| Ok(serde_json::to_value(&*me)?)),
    );

    registry.register_reserved(
        SYSTEM_INFO_METHOD,
        handler_fn(move |_| Ok(system_info(&local))),
    );

    registry.register_reserved(
        LOG_METHOD,
        handler_fn(|req| {
            let message: String = req.args()?;
            info!("{}: {}", req.peer.name, message);
            Ok(Value::Null)
        }),
    );

    registry.register_reserved(
        PRINT_METHOD,
        handler_fn(|req| {
            let message: String = req.args()?;
            // Intentional stdout: printing on the remote kite's terminal is the point
            println!("{}", message);
            Ok(Value::Null)
        }),
    );
}

fn system_info(local: &KiteIdentity) -> Value {
    use sysinfo::{Disks, System};

    let mut sys = System::new();
    sys.refresh_memory();

    let disks = Disks::new_with_refreshed_list();
    let (disk_total, disk_free) = disks
        .list()
        .first()
        .map(|disk| (disk.total_space(), disk.available_space()))
        .unwrap_or((0, 0));

    let uname = [System::name(), System::kernel_version()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");

    json!({
        "diskTotal": disk_total,
        "diskUsage": disk_total.saturating_sub(disk_free),
        "state": "RUNNING",
        "uname": uname,
        "homeDir": dirs::home_dir().map(|p| p.display().to_string()).unwrap_or_default(),
        "username": local.username,
        "memoryUsage": sys.used_memory(),
        "totalMemory": sys.total_memory(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::detached_session;

    fn request(method: &str, args: Value) -> Request {
        Request {
            method: method.to_string(),
            args,
            peer: KiteIdentity {
                username: "alice".into(),
                name: "client".into(),
                ..KiteIdentity::default()
            },
            session: detached_session(),
        }
    }

    fn registry_with_defaults() -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        let local = KiteIdentity {
            username: "ops".into(),
            name: "auth".into(),
            version: "1.0.0".into(),
            ..KiteIdentity::default()
        };
        register_defaults(&registry, Arc::new(local));
        registry
    }

    #[tokio::test]
    async fn test_dispatch_unknown_method() {
        let registry = HandlerRegistry::new();
        let err = registry.dispatch(request("square", json!(4))).await.unwrap_err();
        assert!(matches!(err, KiteError::MethodNotFound { method } if method == "square"));
    }

    #[tokio::test]
    async fn test_dispatch_closure_handler() {
        let registry = HandlerRegistry::new();
        registry
            .register(
                "square",
                handler_fn(|req| {
                    let n: i64 = req.args()?;
                    Ok(json!(n * n))
                }),
            )
            .unwrap();

        let result = registry.dispatch(request("square", json!(4))).await.unwrap();
        assert_eq!(result, json!(16));
    }

    #[tokio::test]
    async fn test_bad_args_are_invalid_params() {
        let registry = HandlerRegistry::new();
        registry
            .register(
                "square",
                handler_fn(|req| {
                    let n: i64 = req.args()?;
                    Ok(json!(n * n))
                }),
            )
            .unwrap();

        let err = registry
            .dispatch(request("square", json!("four")))
            .await
            .unwrap_err();
        assert_eq!(err.to_rpc_error_code(), -32602);
    }

    #[tokio::test]
    async fn test_handler_error_is_wrapped() {
        let registry = HandlerRegistry::new();
        registry
            .register("fail", handler_fn(|_| Err(KiteError::Other("disk full".into()))))
            .unwrap();

        let err = registry.dispatch(request("fail", Value::Null)).await.unwrap_err();
        match err {
            KiteError::Handler { method, message } => {
                assert_eq!(method, "fail");
                assert!(message.contains("disk full"));
            }
            other => panic!("Expected Handler error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_panic_is_caught() {
        let registry = HandlerRegistry::new();
        registry
            .register("boom", handler_fn(|_| panic!("handler bug")))
            .unwrap();

        let err = registry.dispatch(request("boom", Value::Null)).await.unwrap_err();
        assert!(matches!(err, KiteError::Handler { .. }));
    }

    #[tokio::test]
    async fn test_async_trait_handler() {
        struct Slow;

        #[async_trait]
        impl Handler for Slow {
            async fn handle(&self, request: Request) -> Result<Value> {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                Ok(json!({ "peer": request.peer.username }))
            }
        }

        let registry = HandlerRegistry::new();
        registry.register("slow", Arc::new(Slow)).unwrap();
        let result = registry.dispatch(request("slow", Value::Null)).await.unwrap();
        assert_eq!(result, json!({"peer": "alice"}));
    }

    #[tokio::test]
    async fn test_default_methods_present() {
        let registry = registry_with_defaults();
        for method in [PING_METHOD, IDENTITY_METHOD, SYSTEM_INFO_METHOD, LOG_METHOD, PRINT_METHOD] {
            assert!(registry.lookup(method).is_some(), "missing {method}");
            assert!(registry.is_reserved(method));
        }

        let pong = registry.dispatch(request(PING_METHOD, Value::Null)).await.unwrap();
        assert_eq!(pong, json!("pong"));

        let identity = registry.dispatch(request(IDENTITY_METHOD, Value::Null)).await.unwrap();
        assert_eq!(identity["name"], json!("auth"));

        let info = registry.dispatch(request(SYSTEM_INFO_METHOD, Value::Null)).await.unwrap();
        assert_eq!(info["username"], json!("ops"));
        assert!(info.get("totalMemory").is_some());
    }

    #[tokio::test]
    async fn test_reserved_override_before_and_after_serving() {
        let registry = registry_with_defaults();

        // Before serving: last write wins.
        registry
            .register(PING_METHOD, handler_fn(|_| Ok(json!("custom pong"))))
            .unwrap();
        let pong = registry.dispatch(request(PING_METHOD, Value::Null)).await.unwrap();
        assert_eq!(pong, json!("custom pong"));

        // After serving: reserved methods are locked, others are not.
        registry.seal();
        let err = registry
            .register(PING_METHOD, handler_fn(|_| Ok(json!("again"))))
            .unwrap_err();
        assert!(matches!(err, KiteError::ReservedMethod { .. }));
        assert!(registry
            .register("square", handler_fn(|_| Ok(Value::Null)))
            .is_ok());

        let pong = registry.dispatch(request(PING_METHOD, Value::Null)).await.unwrap();
        assert_eq!(pong, json!("custom pong"));
    }
}
