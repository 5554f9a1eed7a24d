//! Token storage and management

use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::session::ExpiryWatcher;

/// Access/renewal credential pair.
///
/// Either half may be absent; both absent is the logged-out state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

/// Durable backend for the credential pair.
pub trait TokenStorage: Send {
    fn load(&self) -> Result<Credentials>;
    fn store(&mut self, credentials: &Credentials) -> Result<()>;
}

/// Storage that lives only as long as the process.
///
/// Clones share contents, so a test can keep one handle and inspect what the
/// session wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Credentials>>,
}

impl MemoryStorage {
    pub fn with(credentials: Credentials) -> Self {
        Self {
            inner: Arc::new(Mutex::new(credentials)),
        }
    }

    pub fn contents(&self) -> Credentials {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl TokenStorage for MemoryStorage {
    fn load(&self) -> Result<Credentials> {
        Ok(self.contents())
    }

    fn store(&mut self, credentials: &Credentials) -> Result<()> {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = credentials.clone();
        Ok(())
    }
}

struct State {
    storage: Box<dyn TokenStorage>,
    current: Credentials,
    /// Bumped on every write; orders watcher updates made outside the lock.
    generation: u64,
}

/// Process-wide holder of the credential pair.
///
/// Reads are served from memory; writes go through to storage. A failed
/// write is logged and the in-memory state still changes.
pub struct TokenStore {
    state: Mutex<State>,
    watcher: ExpiryWatcher,
}

impl TokenStore {
    pub fn new(storage: Box<dyn TokenStorage>, watcher: ExpiryWatcher) -> Self {
        let current = storage.load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load stored credentials, starting logged out: {:#}", e);
            Credentials::default()
        });

        Self {
            state: Mutex::new(State {
                storage,
                current,
                generation: 0,
            }),
            watcher,
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.lock().current.access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.lock().current.refresh_token.clone()
    }

    pub fn snapshot(&self) -> Credentials {
        self.lock().current.clone()
    }

    /// Replace the pair wholesale and re-arm the expiry timers.
    pub fn save(&self, credentials: Credentials) {
        let access = credentials.access_token.clone();
        let generation = self.write(credentials);
        self.arm(access.as_deref(), generation);
    }

    /// Forget both tokens and stop the expiry timers.
    pub fn clear(&self) {
        let generation = self.write(Credentials::default());
        self.watcher.cancel_generation(generation);
    }

    /// Re-arm timers for whatever access token is currently held.
    pub(crate) fn rearm(&self) {
        let (access, generation) = {
            let state = self.lock();
            (state.current.access_token.clone(), state.generation)
        };
        self.arm(access.as_deref(), generation);
    }

    pub fn watcher(&self) -> &ExpiryWatcher {
        &self.watcher
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Outside the state lock: an already-expired token emits synchronously
    /// and handlers may read the store. The generation keeps a slower writer
    /// from re-arming timers for a token that has since been replaced.
    fn arm(&self, access: Option<&str>, generation: u64) {
        match access {
            Some(token) => self.watcher.schedule_generation(token, generation),
            None => self.watcher.cancel_generation(generation),
        }
    }

    fn write(&self, credentials: Credentials) -> u64 {
        let mut state = self.lock();
        if let Err(e) = state.storage.store(&credentials) {
            tracing::warn!("Failed to persist credentials: {:#}", e);
        }
        state.current = credentials;
        state.generation += 1;
        state.generation
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{EventBus, SessionEvent};
    use crate::test_support::{record_events, token_expiring_in};
    use std::time::Duration;

    fn store_over(storage: MemoryStorage) -> (TokenStore, EventBus) {
        let bus = EventBus::new();
        let watcher = ExpiryWatcher::new(bus.clone(), Duration::from_secs(120));
        (TokenStore::new(Box::new(storage), watcher), bus)
    }

    struct FailingStorage;

    impl TokenStorage for FailingStorage {
        fn load(&self) -> Result<Credentials> {
            anyhow::bail!("unreadable")
        }

        fn store(&mut self, _: &Credentials) -> Result<()> {
            anyhow::bail!("read-only")
        }
    }

    #[test]
    fn test_loads_existing_credentials() {
        let storage = MemoryStorage::with(Credentials::new("a", Some("r".into())));
        let (store, _) = store_over(storage);

        assert_eq!(store.access_token().as_deref(), Some("a"));
        assert_eq!(store.refresh_token().as_deref(), Some("r"));
    }

    #[tokio::test]
    async fn test_save_writes_through_and_arms_timers() {
        let storage = MemoryStorage::default();
        let (store, _) = store_over(storage.clone());
        let token = token_expiring_in(Duration::from_secs(3600));

        store.save(Credentials::new(token.clone(), Some("r1".into())));

        assert_eq!(storage.contents().access_token, Some(token));
        assert_eq!(store.watcher().live_timers(), 2);
    }

    #[tokio::test]
    async fn test_clear_cancels_timers_and_storage() {
        let storage = MemoryStorage::default();
        let (store, _) = store_over(storage.clone());
        store.save(Credentials::new(
            token_expiring_in(Duration::from_secs(3600)),
            Some("r1".into()),
        ));

        store.clear();

        assert!(storage.contents().is_empty());
        assert!(store.snapshot().is_empty());
        assert_eq!(store.watcher().live_timers(), 0);
    }

    #[tokio::test]
    async fn test_save_expired_token_emits_expired() {
        let (store, bus) = store_over(MemoryStorage::default());
        let log = record_events(&bus);

        store.save(Credentials::new(
            crate::test_support::token_expiring_at(1_000),
            None,
        ));

        assert_eq!(log.lock().unwrap().as_slice(), [SessionEvent::Expired]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_leave_timers_for_latest_token() {
        let (store, _) = store_over(MemoryStorage::default());
        let store = Arc::new(store);

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for j in 0..25 {
                        let ttl = Duration::from_secs(3600 + i * 100 + j);
                        store.save(Credentials::new(token_expiring_in(ttl), None));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        assert_eq!(store.generation(), 200);
        assert_eq!(store.watcher().generation(), store.generation());
        assert_eq!(store.watcher().live_timers(), 2);

        store.clear();
        assert_eq!(store.watcher().generation(), 201);
        assert_eq!(store.watcher().live_timers(), 0);
    }

    #[test]
    fn test_storage_failures_do_not_block_state() {
        let bus = EventBus::new();
        let watcher = ExpiryWatcher::new(bus, Duration::from_secs(120));
        let store = TokenStore::new(Box::new(FailingStorage), watcher);
        assert!(store.snapshot().is_empty());

        store.save(Credentials::new("opaque", None));
        assert_eq!(store.access_token().as_deref(), Some("opaque"));
    }
}
