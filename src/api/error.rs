//! Typed API errors
//!
//! Every failure the client surfaces has the same shape: a message, the HTTP
//! status when the server answered, and whatever structured details the
//! server put in its error body.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// Statuses worth retrying on an idempotent request.
pub const TRANSIENT_STATUSES: [StatusCode; 4] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Why a request never produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFailure {
    Connect,
    Timeout,
    Cancelled,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No HTTP response (connection, timeout, cancellation).
    Network(NetworkFailure),
    /// Non-2xx response.
    Status,
    /// 2xx response whose body could not be read as the expected type, or a
    /// request that could not be built (bad URL, unserializable body).
    Decode,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApiError {
    pub message: String,
    pub status: Option<StatusCode>,
    pub details: Option<Value>,
    pub kind: ErrorKind,
}

impl ApiError {
    pub fn network(failure: NetworkFailure, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            details: None,
            kind: ErrorKind::Network(failure),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::network(
            NetworkFailure::Timeout,
            format!("Request timed out after {} ms", after.as_millis()),
        )
    }

    pub fn cancelled() -> Self {
        Self::network(NetworkFailure::Cancelled, "Request cancelled")
    }

    pub fn http(status: StatusCode, message: impl Into<String>, details: Option<Value>) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
            details,
            kind: ErrorKind::Status,
        }
    }

    pub fn decode(status: Option<StatusCode>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status,
            details: None,
            kind: ErrorKind::Decode,
        }
    }

    /// Map a transport failure from reqwest.
    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        let failure = if err.is_timeout() {
            NetworkFailure::Timeout
        } else if err.is_connect() {
            NetworkFailure::Connect
        } else {
            NetworkFailure::Other
        };
        Self::network(failure, format!("Network error: {}", err))
    }

    /// Build the error for a non-2xx response from its raw body.
    ///
    /// Prefers a message from a JSON body, then the raw text, then `HTTP <status>`.
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let trimmed = body.trim();
        if let Ok(details) = serde_json::from_str::<Value>(trimmed) {
            let message = json_message(&details)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Self::http(status, message, Some(details));
        }

        let message = if trimmed.is_empty() {
            format!("HTTP {}", status.as_u16())
        } else {
            trimmed.to_string()
        };
        Self::http(status, message, None)
    }

    pub fn is_network(&self) -> bool {
        matches!(self.kind, ErrorKind::Network(_))
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Network(NetworkFailure::Timeout)
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Network(NetworkFailure::Cancelled)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == Some(StatusCode::UNAUTHORIZED)
    }

    /// Network failures (other than caller cancellation) and 429/502/503/504.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            ErrorKind::Network(NetworkFailure::Cancelled) => false,
            ErrorKind::Network(_) => true,
            ErrorKind::Status => self
                .status
                .map_or(false, |s| TRANSIENT_STATUSES.contains(&s)),
            ErrorKind::Decode => false,
        }
    }
}

/// Pull a human-readable message out of a JSON error body.
fn json_message(details: &Value) -> Option<String> {
    match details {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(map) => ["message", "error", "title", "detail"]
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(|v| match v {
                Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
                Value::Object(_) => json_message(v),
                _ => None,
            }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_body_message_and_details() {
        let err = ApiError::from_response(
            StatusCode::BAD_REQUEST,
            r#"{"message":"Code already exists","errors":{"code":["duplicate"]}}"#,
        );
        assert_eq!(err.message, "Code already exists");
        assert_eq!(err.status, Some(StatusCode::BAD_REQUEST));
        assert_eq!(err.details.as_ref().unwrap()["errors"]["code"][0], json!("duplicate"));
        assert_eq!(err.kind, ErrorKind::Status);
    }

    #[test]
    fn test_problem_details_title() {
        let err = ApiError::from_response(
            StatusCode::CONFLICT,
            r#"{"title":"Stock would go negative","status":409}"#,
        );
        assert_eq!(err.to_string(), "Stock would go negative");
    }

    #[test]
    fn test_nested_error_object() {
        let err = ApiError::from_response(
            StatusCode::FORBIDDEN,
            r#"{"error":{"message":"Role lacks permission"}}"#,
        );
        assert_eq!(err.message, "Role lacks permission");
    }

    #[test]
    fn test_text_and_empty_fallbacks() {
        let err = ApiError::from_response(StatusCode::BAD_GATEWAY, "upstream down\n");
        assert_eq!(err.message, "upstream down");
        assert!(err.details.is_none());

        let err = ApiError::from_response(StatusCode::INTERNAL_SERVER_ERROR, "");
        assert_eq!(err.message, "HTTP 500");

        let err = ApiError::from_response(StatusCode::NOT_FOUND, r#"{"code":7}"#);
        assert_eq!(err.message, "HTTP 404");
        assert!(err.details.is_some());
    }

    #[test]
    fn test_classification() {
        for status in TRANSIENT_STATUSES {
            assert!(ApiError::http(status, "x", None).is_transient());
        }
        assert!(!ApiError::http(StatusCode::INTERNAL_SERVER_ERROR, "x", None).is_transient());
        assert!(!ApiError::http(StatusCode::UNAUTHORIZED, "x", None).is_transient());
        assert!(ApiError::http(StatusCode::UNAUTHORIZED, "x", None).is_unauthorized());

        let timeout = ApiError::timeout(Duration::from_millis(5));
        assert!(timeout.is_network() && timeout.is_timeout() && timeout.is_transient());
        assert!(timeout.status.is_none());

        let cancelled = ApiError::cancelled();
        assert!(cancelled.is_network() && !cancelled.is_transient());

        assert!(!ApiError::decode(None, "bad").is_network());
    }
}
