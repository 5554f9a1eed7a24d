//! Session context
//!
//! One `Session` per process, created by the application root and handed to
//! the API client and to anything that wants lifecycle events.

pub mod events;
pub mod expiry;

use std::sync::Arc;
use std::time::Duration;

pub use events::{EventBus, SessionEvent, SessionEventKind, Subscription};
pub use expiry::{ExpiryWatcher, DEFAULT_LEAD};

use crate::auth::tokens::{MemoryStorage, TokenStorage, TokenStore};

/// Shared session state: credentials plus the event bus they report to.
#[derive(Clone)]
pub struct Session {
    tokens: Arc<TokenStore>,
    events: EventBus,
}

impl Session {
    /// Build a session over `storage`. Credentials already in storage are loaded
    /// but their expiry timers are not armed until [`Session::resume`].
    pub fn new(storage: Box<dyn TokenStorage>, lead: Duration) -> Self {
        let events = EventBus::new();
        let watcher = ExpiryWatcher::new(events.clone(), lead);
        Self {
            tokens: Arc::new(TokenStore::new(storage, watcher)),
            events,
        }
    }

    /// Session with no durable backing.
    pub fn in_memory(lead: Duration) -> Self {
        Self::new(Box::new(MemoryStorage::default()), lead)
    }

    /// Arm expiry timers for a stored access token (process start).
    pub fn resume(&self) {
        self.tokens.rearm();
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe<F>(&self, kind: SessionEventKind, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(kind, handler)
    }
}
