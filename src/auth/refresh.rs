//! Session renewal
//!
//! Exchanges the stored renewal token for a fresh credential pair. Only one
//! exchange runs at a time: callers that arrive while one is pending await
//! the same shared outcome instead of starting their own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::header::ACCEPT;
use serde::Deserialize;
use url::Url;

use super::tokens::Credentials;
use crate::session::{Session, SessionEvent};

/// Body of a successful sign-in or renewal response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

type PendingRenewal = Shared<BoxFuture<'static, bool>>;

struct Inner {
    http: reqwest::Client,
    url: Url,
    timeout: Duration,
    session: Session,
    pending: Mutex<Option<PendingRenewal>>,
    exchanges: AtomicU64,
}

/// Single-flight renewal of the session credentials.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(http: reqwest::Client, url: Url, timeout: Duration, session: Session) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                url,
                timeout,
                session,
                pending: Mutex::new(None),
                exchanges: AtomicU64::new(0),
            }),
        }
    }

    /// Renew the session, joining a renewal already in flight if there is one.
    ///
    /// Returns `true` when fresh credentials were stored. On `false` the
    /// credentials are cleared and `Expired` has been emitted.
    pub async fn refresh_once(&self) -> bool {
        let pending = {
            let mut slot = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(pending) => {
                    tracing::debug!("Joining renewal already in flight");
                    pending.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    // Runs on its own task so a cancelled caller cannot abort a
                    // renewal other callers are waiting on.
                    let task = tokio::spawn(async move {
                        let renewed = inner.exchange().await;
                        inner
                            .pending
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .take();
                        renewed
                    });
                    let pending = task.map(|joined| joined.unwrap_or(false)).boxed().shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    /// Renewal exchanges issued so far.
    pub fn exchange_count(&self) -> u64 {
        self.inner.exchanges.load(Ordering::SeqCst)
    }
}

impl Inner {
    async fn exchange(&self) -> bool {
        let tokens = self.session.tokens();
        let Some(refresh_token) = tokens.refresh_token() else {
            tracing::debug!("No renewal token stored, session cannot be renewed");
            self.fail();
            return false;
        };

        self.exchanges.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Renewing session at {}", self.url);

        match self.request(&refresh_token).await {
            Ok(response) => {
                let Some(access_token) = response.access_token.filter(|t| !t.is_empty()) else {
                    tracing::debug!("Renewal response missing accessToken");
                    self.fail();
                    return false;
                };
                // Keep the current renewal token when the server does not rotate it.
                let refresh_token = response.refresh_token.or(Some(refresh_token));
                tokens.save(Credentials {
                    access_token: Some(access_token),
                    refresh_token,
                });
                tracing::debug!("Session renewed");
                self.session.events().emit(SessionEvent::Refreshed);
                true
            }
            Err(reason) => {
                tracing::debug!("Session renewal failed: {}", reason);
                self.fail();
                false
            }
        }
    }

    /// Bare call: no bearer token, no retries, no nested renewal.
    async fn request(&self, refresh_token: &str) -> Result<TokenResponse, String> {
        let resp = self
            .http
            .post(self.url.clone())
            .header(ACCEPT, "application/json")
            .json(refresh_token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status.as_u16()));
        }

        resp.json::<TokenResponse>()
            .await
            .map_err(|e| format!("malformed response: {}", e))
    }

    fn fail(&self) {
        self.session.tokens().clear();
        self.session.events().emit(SessionEvent::Expired);
    }
}
