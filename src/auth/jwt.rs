//! Access-token payload decoding
//!
//! Access tokens are JWT-shaped: `header.payload.signature`, each segment
//! base64url. Only the payload is read, and only to learn who the token is
//! for and when it expires. The signature is not checked; the server is the
//! authority on validity.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{Map, Value};

/// Decode the payload segment of `token`. Returns `None` if it is missing or not a JSON object.
pub fn payload(token: &str) -> Option<Map<String, Value>> {
    let segment = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .ok()?;
    match serde_json::from_slice(&bytes).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Expiry instant of `token` in Unix milliseconds.
///
/// `exp` is seconds since the epoch, integer or fractional.
pub fn expires_at_ms(token: &str) -> Option<u64> {
    let exp = payload(token)?.get("exp")?.as_f64()?;
    if !exp.is_finite() || exp < 0.0 {
        return None;
    }
    Some((exp * 1000.0) as u64)
}

/// Best-effort display name: `unique_name`, then `name`, then `sub`.
pub fn subject(token: &str) -> Option<String> {
    let claims = payload(token)?;
    ["unique_name", "name", "sub"]
        .iter()
        .filter_map(|key| claims.get(*key))
        .find_map(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::token_with_payload;
    use serde_json::json;

    #[test]
    fn test_integer_exp() {
        let token = token_with_payload(&json!({ "exp": 1_700_000_000u64 }));
        assert_eq!(expires_at_ms(&token), Some(1_700_000_000_000));
    }

    #[test]
    fn test_fractional_exp() {
        let token = token_with_payload(&json!({ "exp": 1.5 }));
        assert_eq!(expires_at_ms(&token), Some(1500));
    }

    #[test]
    fn test_subject_prefers_unique_name() {
        let token = token_with_payload(&json!({ "sub": 42, "unique_name": "clerk" }));
        assert_eq!(subject(&token).as_deref(), Some("clerk"));

        let numeric = token_with_payload(&json!({ "sub": 42 }));
        assert_eq!(subject(&numeric).as_deref(), Some("42"));
    }

    #[test]
    fn test_padded_payload_is_accepted() {
        let token = token_with_payload(&json!({ "exp": 10 }));
        let mut parts: Vec<String> = token.split('.').map(String::from).collect();
        while parts[1].len() % 4 != 0 {
            parts[1].push('=');
        }
        assert_eq!(expires_at_ms(&parts.join(".")), Some(10_000));
    }

    #[test]
    fn test_unparsable_tokens() {
        assert_eq!(expires_at_ms("opaque-token"), None);
        assert_eq!(expires_at_ms("a.!!!.c"), None);
        let no_exp = token_with_payload(&json!({ "sub": "x" }));
        assert_eq!(expires_at_ms(&no_exp), None);
        let not_json = format!("h.{}.s", URL_SAFE_NO_PAD.encode("plain text"));
        assert_eq!(expires_at_ms(&not_json), None);
        let negative = token_with_payload(&json!({ "exp": -5 }));
        assert_eq!(expires_at_ms(&negative), None);
    }
}
