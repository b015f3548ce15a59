//! Lifecycle hooks: connect, first authenticated request, disconnect.
//!
//! Hooks run synchronously, in registration order, on the task that fires
//! them. A failing or panicking hook is logged and skipped; it never stops
//! the remaining hooks or the session. Firing works on a snapshot of the
//! list, so a hook may register further hooks; those run from the next
//! firing on.

use crate::session::Session;
use crate::Result;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::error;

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    Connect,
    FirstRequest,
    Disconnect,
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookEvent::Connect => write!(f, "connect"),
            HookEvent::FirstRequest => write!(f, "first-request"),
            HookEvent::Disconnect => write!(f, "disconnect"),
        }
    }
}

/// A lifecycle callback.
pub type Hook = Arc<dyn Fn(&Session) -> Result<()> + Send + Sync>;

/// Ordered hook lists, one per [`HookEvent`].
#[derive(Default)]
pub struct HookBus {
    on_connect: RwLock<Vec<Hook>>,
    on_first_request: RwLock<Vec<Hook>>,
    on_disconnect: RwLock<Vec<Hook>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, event: HookEvent) -> &RwLock<Vec<Hook>> {
        match event {
            HookEvent::Connect => &self.on_connect,
            HookEvent::FirstRequest => &self.on_first_request,
            HookEvent::Disconnect => &self.on_disconnect,
        }
    }

    /// Append `hook` to the list for `event`.
    pub fn register<F>(&self, event: HookEvent, hook: F)
    where
        F: Fn(&Session) -> Result<()> + Send + Sync + 'static,
    {
        self.list(event)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    pub fn on_connect<F>(&self, hook: F)
    where
        F: Fn(&Session) -> Result<()> + Send + Sync + 'static,
    {
        self.register(HookEvent::Connect, hook);
    }

    pub fn on_first_request<F>(&self, hook: F)
    where
        F: Fn(&Session) -> Result<()> + Send + Sync + 'static,
    {
        self.register(HookEvent::FirstRequest, hook);
    }

    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn(&Session) -> Result<()> + Send + Sync + 'static,
    {
        self.register(HookEvent::Disconnect, hook);
    }

    pub fn len(&self, event: HookEvent) -> usize {
        self.list(event)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run every hook registered for `event`, in order.
    pub fn fire(&self, event: HookEvent, session: &Session) {
        let snapshot: Vec<Hook> = self
            .list(event)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (index, hook) in snapshot.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| hook(session))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("{} hook #{} failed for session {}: {}", event, index, session.id(), e);
                }
                Err(_) => {
                    error!("{} hook #{} panicked for session {}", event, index, session.id());
                }
            }
        }
    }
}

impl fmt::Debug for HookBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookBus")
            .field("on_connect", &self.len(HookEvent::Connect))
            .field("on_first_request", &self.len(HookEvent::FirstRequest))
            .field("on_disconnect", &self.len(HookEvent::Disconnect))
            .finish()
    }
}
