//! Session lifecycle events
//!
//! A small observer registry with three channels (expiring-soon, expired,
//! refreshed). Emission is synchronous and runs handlers in subscription
//! order. A panicking handler is logged and skipped so the rest still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

/// Names of the three session channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    ExpiringSoon,
    Expired,
    Refreshed,
}

/// A session lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The access token expires in `remaining_ms` milliseconds.
    ExpiringSoon { remaining_ms: u64 },
    /// The access token has expired or renewal failed. Callers should re-authenticate.
    Expired,
    /// A renewal exchange stored a fresh credential pair.
    Refreshed,
}

impl SessionEvent {
    pub fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::ExpiringSoon { .. } => SessionEventKind::ExpiringSoon,
            SessionEvent::Expired => SessionEventKind::Expired,
            SessionEvent::Refreshed => SessionEventKind::Refreshed,
        }
    }
}

type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<(u64, SessionEventKind, Handler)>,
}

/// Publish/subscribe hub for session events.
///
/// Clones share the same registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe<F>(&self, kind: SessionEventKind, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let id = registry.next_id;
        registry.next_id += 1;
        registry.handlers.push((id, kind, Arc::new(handler)));

        Subscription {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    /// Subscribe through an unbounded channel instead of a callback.
    pub fn subscribe_channel(
        &self,
        kind: SessionEventKind,
    ) -> (Subscription, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(kind, move |event| {
            // Receiver gone means nobody is listening any more.
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    /// Notify every current subscriber of `event.kind()`.
    pub fn emit(&self, event: SessionEvent) {
        let kind = event.kind();

        // Snapshot so handlers may subscribe/unsubscribe without deadlocking.
        let handlers: Vec<Handler> = {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry
                .handlers
                .iter()
                .filter(|(_, k, _)| *k == kind)
                .map(|(_, _, h)| Arc::clone(h))
                .collect()
        };

        tracing::debug!("Session event {:?} -> {} handler(s)", event, handlers.len());

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::warn!("Session event handler panicked while handling {:?}", kind);
            }
        }
    }

    /// Number of live subscriptions for `kind`.
    pub fn subscriber_count(&self, kind: SessionEventKind) -> usize {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry
            .handlers
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .count()
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping it leaves the handler registered; call [`Subscription::unsubscribe`].
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    id: u64,
}

impl Subscription {
    /// Remove the handler. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.handlers.retain(|(id, _, _)| *id != self.id);
        }
    }
}
