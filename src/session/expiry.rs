//! Access-token expiry timers
//!
//! Turns the `exp` claim of an access token into two one-shot notifications:
//! `ExpiringSoon` a lead window before expiry and `Expired` at expiry.
//! At most one pair of timers is live; scheduling replaces the previous pair.

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::events::{EventBus, SessionEvent};
use crate::auth::jwt;

/// Default lead window for the expiring-soon warning.
pub const DEFAULT_LEAD: Duration = Duration::from_secs(120);

struct TimerPair {
    expiring_soon: JoinHandle<()>,
    expired: JoinHandle<()>,
}

impl TimerPair {
    fn abort(&self) {
        self.expiring_soon.abort();
        self.expired.abort();
    }

    fn live(&self) -> usize {
        [&self.expiring_soon, &self.expired]
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }
}

/// Live timers plus the store generation they were armed for.
#[derive(Default)]
struct Armed {
    generation: u64,
    timers: Option<TimerPair>,
}

impl Armed {
    /// Record `generation` unless a newer one has already been applied.
    fn accepts(&mut self, generation: Option<u64>) -> bool {
        match generation {
            Some(g) if g < self.generation => false,
            Some(g) => {
                self.generation = g;
                true
            }
            None => true,
        }
    }

    fn disarm(&mut self) {
        if let Some(pair) = self.timers.take() {
            pair.abort();
        }
    }
}

pub struct ExpiryWatcher {
    events: EventBus,
    lead: Duration,
    armed: Mutex<Armed>,
}

impl ExpiryWatcher {
    pub fn new(events: EventBus, lead: Duration) -> Self {
        Self {
            events,
            lead,
            armed: Mutex::new(Armed::default()),
        }
    }

    pub fn lead(&self) -> Duration {
        self.lead
    }

    /// Arm timers for `access_token`, replacing any live pair.
    ///
    /// Tokens without a readable `exp` arm nothing; the 401 path covers them.
    pub fn schedule(&self, access_token: &str) {
        self.arm(access_token, now_ms(), None);
    }

    /// Like [`ExpiryWatcher::schedule`], but ignored if a later store
    /// generation has already been applied.
    pub(crate) fn schedule_generation(&self, access_token: &str, generation: u64) {
        self.arm(access_token, now_ms(), Some(generation));
    }

    pub(crate) fn schedule_at(&self, access_token: &str, now_ms: u64) {
        self.arm(access_token, now_ms, None);
    }

    /// Abort both timers. No-op when none are armed.
    pub fn cancel(&self) {
        self.lock().disarm();
    }

    pub(crate) fn cancel_generation(&self, generation: u64) {
        let mut armed = self.lock();
        if armed.accepts(Some(generation)) {
            armed.disarm();
        }
    }

    /// Timers that have not fired or been aborted yet (0, 1 or 2).
    pub fn live_timers(&self) -> usize {
        self.lock().timers.as_ref().map_or(0, TimerPair::live)
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.lock().generation
    }

    fn arm(&self, access_token: &str, now_ms: u64, generation: Option<u64>) {
        let expires_at_ms = jwt::expires_at_ms(access_token);

        let expired_now = {
            let mut armed = self.lock();
            if !armed.accepts(generation) {
                tracing::debug!("Newer credentials already armed, skipping stale token");
                return;
            }
            armed.disarm();

            match expires_at_ms {
                None => {
                    tracing::debug!("Access token has no readable exp claim, expiry timers not armed");
                    return;
                }
                Some(at) if at <= now_ms => true,
                Some(at) => {
                    armed.timers = self.spawn_pair(Duration::from_millis(at - now_ms));
                    false
                }
            }
        };

        // Outside the lock: handlers may save or clear credentials.
        if expired_now {
            tracing::debug!("Access token already expired");
            self.events.emit(SessionEvent::Expired);
        }
    }

    fn spawn_pair(&self, ttl: Duration) -> Option<TimerPair> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime, expiry timers not armed");
            return None;
        };

        let start = Instant::now();
        let deadline = start + ttl;
        let warn_at = deadline
            .checked_sub(self.lead)
            .filter(|t| *t > start)
            .unwrap_or(start);

        tracing::debug!(
            "Expiry timers armed: warning in {:?}, expiry in {:?}",
            warn_at - start,
            ttl
        );

        let events = self.events.clone();
        let expiring_soon = runtime.spawn(async move {
            time::sleep_until(warn_at).await;
            let remaining_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64;
            events.emit(SessionEvent::ExpiringSoon { remaining_ms });
        });

        let events = self.events.clone();
        let expired = runtime.spawn(async move {
            time::sleep_until(deadline).await;
            events.emit(SessionEvent::Expired);
        });

        Some(TimerPair {
            expiring_soon,
            expired,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Armed> {
        self.armed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ExpiryWatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::events::SessionEventKind;
    use crate::test_support::{record_events, token_expiring_at};
    use std::sync::Arc;

    const NOW_MS: u64 = 1_700_000_000_000;

    fn watcher(lead_ms: u64) -> (ExpiryWatcher, Arc<Mutex<Vec<SessionEvent>>>) {
        let bus = EventBus::new();
        let log = record_events(&bus);
        (ExpiryWatcher::new(bus, Duration::from_millis(lead_ms)), log)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_warning_then_expiry() {
        let (watcher, log) = watcher(120_000);
        watcher.schedule_at(&token_expiring_at((NOW_MS + 150_000) / 1000), NOW_MS);
        assert_eq!(watcher.live_timers(), 2);

        time::advance(Duration::from_millis(29_999)).await;
        settle().await;
        assert!(log.lock().unwrap().is_empty());

        time::advance(Duration::from_millis(1)).await;
        settle().await;
        let events = log.lock().unwrap().clone();
        match events.as_slice() {
            [SessionEvent::ExpiringSoon { remaining_ms }] => {
                assert!((119_000..=120_000).contains(remaining_ms), "{}", remaining_ms)
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert_eq!(watcher.live_timers(), 1);

        time::advance(Duration::from_millis(120_000)).await;
        settle().await;
        assert_eq!(log.lock().unwrap().last(), Some(&SessionEvent::Expired));
        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(watcher.live_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warning_clamped_to_now_inside_lead_window() {
        let (watcher, log) = watcher(120_000);
        watcher.schedule_at(&token_expiring_at((NOW_MS + 60_000) / 1000), NOW_MS);

        settle().await;
        match log.lock().unwrap().first() {
            Some(SessionEvent::ExpiringSoon { remaining_ms }) => {
                assert!((59_000..=60_000).contains(remaining_ms), "{}", remaining_ms)
            }
            other => panic!("expected immediate warning, got {:?}", other),
        };
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_expiry_emits_immediately() {
        let (watcher, log) = watcher(120_000);
        watcher.schedule_at(&token_expiring_at(NOW_MS / 1000 - 5), NOW_MS);

        assert_eq!(log.lock().unwrap().as_slice(), [SessionEvent::Expired]);
        assert_eq!(watcher.live_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pair() {
        let (watcher, log) = watcher(120_000);
        watcher.schedule_at(&token_expiring_at((NOW_MS + 150_000) / 1000), NOW_MS);
        watcher.schedule_at(&token_expiring_at((NOW_MS + 600_000) / 1000), NOW_MS);
        assert_eq!(watcher.live_timers(), 2);

        // The first pair would have fired by now.
        time::advance(Duration::from_millis(200_000)).await;
        settle().await;
        assert!(log.lock().unwrap().is_empty());

        time::advance(Duration::from_millis(400_000)).await;
        settle().await;
        let kinds: Vec<_> = log.lock().unwrap().iter().map(SessionEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![SessionEventKind::ExpiringSoon, SessionEventKind::Expired]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let (watcher, log) = watcher(1_000);
        watcher.schedule_at(&token_expiring_at((NOW_MS + 10_000) / 1000), NOW_MS);
        watcher.cancel();
        watcher.cancel();
        settle().await;

        time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(watcher.live_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_is_ignored() {
        let (watcher, log) = watcher(120_000);
        let now = now_ms() / 1000;
        watcher.schedule_generation(&token_expiring_at(now + 600), 2);
        watcher.schedule_generation(&token_expiring_at(now + 150), 1);
        watcher.schedule_generation(&token_expiring_at(1_000), 1);
        assert_eq!(watcher.generation(), 2);
        assert_eq!(watcher.live_timers(), 2);

        // The stale 150s token would have warned and expired by now.
        time::advance(Duration::from_secs(200)).await;
        settle().await;
        assert!(log.lock().unwrap().is_empty());

        watcher.cancel_generation(1);
        assert_eq!(watcher.live_timers(), 2);
        watcher.cancel_generation(3);
        assert_eq!(watcher.live_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_token_arms_nothing() {
        let (watcher, log) = watcher(1_000);
        watcher.schedule_at(&token_expiring_at((NOW_MS + 10_000) / 1000), NOW_MS);
        watcher.schedule_at("not-a-jwt", NOW_MS);

        assert_eq!(watcher.live_timers(), 0);
        time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(log.lock().unwrap().is_empty());
    }
}
