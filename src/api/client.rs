//! Authenticated HTTP client for the ERP API
//!
//! Wraps reqwest::Client with bearer token injection, per-attempt timeouts,
//! cancellation, one renewal-and-retry on 401, and bounded backoff for
//! transient failures on read-only requests.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::error::ApiError;
use super::request::{
    build_url, is_idempotent, Payload, QueryParams, RequestBody, RequestOptions, RetryPolicy,
};
use crate::auth::RefreshCoordinator;
use crate::config::Settings;
use crate::session::Session;

pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    session: Session,
    refresher: RefreshCoordinator,
    timeout: Duration,
    retry: RetryPolicy,
    default_query: QueryParams,
    /// Sign-in and renewal endpoints; never sent a bearer token.
    auth_paths: Vec<String>,
    /// Anonymous read-only prefixes.
    public_paths: Vec<String>,
}

impl ApiClient {
    pub fn new(settings: &Settings, session: Session) -> Result<Self> {
        let base_url = Url::parse(&settings.base_url)
            .with_context(|| format!("Invalid API base URL {}", settings.base_url))?;
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;

        let refresh_url = build_url(&base_url, &settings.refresh_path, &QueryParams::new())
            .context("Invalid refresh path")?;
        let refresher =
            RefreshCoordinator::new(http.clone(), refresh_url, settings.timeout(), session.clone());

        Ok(Self {
            http,
            base_url,
            session,
            refresher,
            timeout: settings.timeout(),
            retry: settings.retry_policy(),
            default_query: settings.default_query.iter().collect(),
            auth_paths: vec![settings.login_path.clone(), settings.refresh_path.clone()],
            public_paths: settings.public_paths.clone(),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.refresher
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        options: &RequestOptions,
    ) -> Result<T, ApiError> {
        self.send_typed(Method::GET, path, None, options).await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
        options: &RequestOptions,
    ) -> Result<T, ApiError> {
        self.send_typed(Method::DELETE, path, None, options).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B, options: &RequestOptions) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = RequestBody::json(body)?;
        self.send_typed(Method::POST, path, Some(body), options).await
    }

    pub async fn put<B, T>(&self, path: &str, body: &B, options: &RequestOptions) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = RequestBody::json(body)?;
        self.send_typed(Method::PUT, path, Some(body), options).await
    }

    pub async fn patch<B, T>(&self, path: &str, body: &B, options: &RequestOptions) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = RequestBody::json(body)?;
        self.send_typed(Method::PATCH, path, Some(body), options).await
    }

    async fn send_typed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<RequestBody>,
        options: &RequestOptions,
    ) -> Result<T, ApiError> {
        self.send(method, path, body, options)
            .await?
            .into_typed()
            .map_err(|e| ApiError::decode(None, format!("Unexpected response from {}: {}", path, e)))
    }

    /// Run one logical request through auth, timeout, renewal and retry.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<RequestBody>,
        options: &RequestOptions,
    ) -> Result<Payload, ApiError> {
        let url = build_url(&self.base_url, path, &self.default_query.merged(&options.query))?;
        // The bearer token only ever goes to the configured backend.
        let use_auth =
            url.origin() == self.base_url.origin() && self.requires_auth(&method, path, options);
        let policy = options.retry.unwrap_or(self.retry);
        let retryable = is_idempotent(&method);

        let mut attempt = 1;
        let mut renewed = false;

        loop {
            tracing::debug!("{} {} (attempt {})", method, url, attempt);

            // Read per attempt so a retry after renewal carries the new token.
            let sent = if use_auth {
                self.session.tokens().access_token()
            } else {
                None
            };

            let err = match self
                .attempt(&method, &url, body.as_ref(), options, sent.as_deref())
                .await
            {
                Ok(payload) => return Ok(payload),
                Err(err) => err,
            };

            if err.is_unauthorized() && use_auth && !renewed {
                renewed = true;
                tracing::debug!("401 from {}, renewing session", path);
                if self.renew(sent.as_deref(), options).await? {
                    continue;
                }
                return Err(err);
            }

            if err.is_transient() && retryable && attempt < policy.max_attempts {
                let delay = policy.delay_for(attempt);
                tracing::debug!("{} {} failed ({}), retrying in {:?}", method, url, err, delay);
                backoff(delay, options.cancel.as_ref()).await?;
                attempt += 1;
                continue;
            }

            return Err(err);
        }
    }

    /// Recover from a 401 on a request that went out with `sent`.
    ///
    /// If the stored token changed meanwhile, a renewal (or sign-in) already
    /// settled: retry with the new token, or give up if the store was cleared.
    /// Otherwise join the single-flight renewal.
    async fn renew(&self, sent: Option<&str>, options: &RequestOptions) -> Result<bool, ApiError> {
        let current = self.session.tokens().access_token();
        if current.as_deref() != sent {
            tracing::debug!("Credentials changed since the request was sent");
            return Ok(current.is_some());
        }

        tokio::select! {
            biased;
            _ = cancelled(options.cancel.as_ref()) => Err(ApiError::cancelled()),
            renewed = self.refresher.refresh_once() => Ok(renewed),
        }
    }

    /// Whether this call carries the bearer token and may trigger renewal.
    fn requires_auth(&self, method: &Method, path: &str, options: &RequestOptions) -> bool {
        if options.auth == Some(false) || options.headers.contains_key(AUTHORIZATION) {
            return false;
        }
        let path = normalize_path(path);
        if self.auth_paths.iter().any(|p| path_matches(&path, p)) {
            return false;
        }
        let public = is_idempotent(method) && self.public_paths.iter().any(|p| path_matches(&path, p));
        !public
    }

    fn headers(&self, body: Option<&RequestBody>, options: &RequestOptions) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if !body.map_or(false, RequestBody::is_binary) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        for (name, value) in &options.headers {
            headers.insert(name.clone(), value.clone());
        }
        headers
    }

    /// One network exchange, raced against the timeout and the caller's cancellation.
    async fn attempt(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&RequestBody>,
        options: &RequestOptions,
        token: Option<&str>,
    ) -> Result<Payload, ApiError> {
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .headers(self.headers(body, options));

        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.body(body.bytes());
        }

        let timeout = options.timeout.unwrap_or(self.timeout);
        let exchange = async {
            let resp = request.send().await.map_err(ApiError::from_transport)?;
            classify(resp).await
        };

        tokio::select! {
            biased;
            _ = cancelled(options.cancel.as_ref()) => Err(ApiError::cancelled()),
            result = tokio::time::timeout(timeout, exchange) => {
                result.unwrap_or_else(|_| Err(ApiError::timeout(timeout)))
            }
        }
    }
}

/// Turn a response into a payload or a typed error.
async fn classify(resp: reqwest::Response) -> Result<Payload, ApiError> {
    let status = resp.status();
    let is_json = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |ct| ct.contains("json"));
    let text = resp.text().await.map_err(ApiError::from_transport)?;

    if !status.is_success() {
        return Err(ApiError::from_response(status, &text));
    }

    if status == StatusCode::NO_CONTENT || text.is_empty() {
        Ok(Payload::Empty)
    } else if is_json {
        serde_json::from_str(&text)
            .map(Payload::Json)
            .map_err(|e| ApiError::decode(Some(status), format!("Invalid JSON response: {}", e)))
    } else {
        Ok(Payload::Text(text))
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn backoff(delay: Duration, cancel: Option<&CancellationToken>) -> Result<(), ApiError> {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => Err(ApiError::cancelled()),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Path without scheme/host/query, with a leading slash.
fn normalize_path(path: &str) -> String {
    let path = match Url::parse(path) {
        Ok(url) => url.path().to_string(),
        Err(_) => path.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    format!("/{}", path.trim_start_matches('/'))
}

/// `prefix` matches itself and anything below it, on segment boundaries.
fn path_matches(path: &str, prefix: &str) -> bool {
    let prefix = format!("/{}", prefix.trim_matches('/'));
    if prefix == "/" {
        return true;
    }
    path == prefix || path.starts_with(&format!("{}/", prefix))
}
