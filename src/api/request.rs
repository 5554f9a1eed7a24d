//! Request descriptors: query parameters, bodies, per-call options

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::error::ApiError;

/// Query parameters keyed by name.
///
/// Values may be absent; absent and empty values are dropped when the URL is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(BTreeMap<String, Option<String>>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), Some(value.to_string()));
        self
    }

    pub fn set_opt<V: ToString>(mut self, key: impl Into<String>, value: Option<V>) -> Self {
        self.0.insert(key.into(), value.map(|v| v.to_string()));
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Option<String>) {
        self.0.insert(key.into(), value);
    }

    /// Layer `overrides` on top of `self`; keys in `overrides` win.
    pub fn merged(&self, overrides: &QueryParams) -> QueryParams {
        let mut out = self.clone();
        for (k, v) in &overrides.0 {
            out.0.insert(k.clone(), v.clone());
        }
        out
    }

    /// Pairs that will actually be sent.
    pub fn sanitized(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().filter_map(|(k, v)| match v.as_deref() {
            Some(v) if !v.is_empty() => Some((k.as_str(), v)),
            _ => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = QueryParams::new();
        for (k, v) in iter {
            params.insert(k, Some(v.to_string()));
        }
        params
    }
}

/// Join `path` onto `base` and append the sanitized query.
///
/// Absolute `http(s)://` paths are used as-is.
pub fn build_url(base: &Url, path: &str, query: &QueryParams) -> Result<Url, ApiError> {
    let raw = if path.starts_with("http://") || path.starts_with("https://") {
        path.to_string()
    } else {
        format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    };

    let mut url = Url::parse(&raw)
        .map_err(|e| ApiError::decode(None, format!("Invalid request URL {}: {}", raw, e)))?;

    let mut pairs = query.sanitized().peekable();
    if pairs.peek().is_some() {
        let mut serializer = url.query_pairs_mut();
        for (k, v) in pairs {
            serializer.append_pair(k, v);
        }
    }
    Ok(url)
}

/// Request body. Serialized once; retries resend the same bytes.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(Bytes),
    /// Raw bytes; no Content-Type is forced (set one through the headers if needed).
    Binary(Bytes),
}

impl RequestBody {
    pub fn json<B: Serialize + ?Sized>(body: &B) -> Result<Self, ApiError> {
        serde_json::to_vec(body)
            .map(|v| RequestBody::Json(Bytes::from(v)))
            .map_err(|e| ApiError::decode(None, format!("Failed to serialize request body: {}", e)))
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        RequestBody::Binary(data.into())
    }

    pub(crate) fn bytes(&self) -> Bytes {
        match self {
            RequestBody::Json(b) | RequestBody::Binary(b) => b.clone(),
        }
    }

    pub(crate) fn is_binary(&self) -> bool {
        matches!(self, RequestBody::Binary(_))
    }
}

/// Bounded exponential backoff for idempotent requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Wait before attempt `attempt + 1`: `base * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

/// Read-only methods; the only ones retried automatically.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Per-call overrides. Everything defaults to the client's settings.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub query: QueryParams,
    pub headers: HeaderMap,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    /// `false` never attaches the bearer token.
    pub auth: Option<bool>,
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, query: QueryParams) -> Self {
        self.query = query;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.insert(key, Some(value.to_string()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn no_auth(mut self) -> Self {
        self.auth = Some(false);
        self
    }

    pub fn cancel_with(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// A classified 2xx response.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// 204 or an empty body.
    Empty,
    Json(Value),
    Text(String),
}

impl Payload {
    /// Deserialize into `T`. `Empty` reads as JSON `null`, `Text` as a JSON string.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, serde_json::Error> {
        let value = match self {
            Payload::Empty => Value::Null,
            Payload::Json(v) => v,
            Payload::Text(s) => Value::String(s),
        };
        serde_json::from_value(value)
    }
}
