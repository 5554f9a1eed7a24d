//! Helpers shared by unit tests.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};

use crate::session::{EventBus, SessionEvent, SessionEventKind};

/// Unsigned JWT-shaped token carrying `payload`.
pub fn token_with_payload(payload: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.sig", header, body)
}

/// Token whose `exp` is `exp_secs` (Unix seconds).
pub fn token_expiring_at(exp_secs: u64) -> String {
    token_with_payload(&json!({ "sub": "1", "exp": exp_secs }))
}

/// Token expiring `ttl` from the wall clock.
pub fn token_expiring_in(ttl: Duration) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    token_expiring_at(now + ttl.as_secs())
}

/// Record every session event emitted on `bus`, in order.
pub fn record_events(bus: &EventBus) -> Arc<Mutex<Vec<SessionEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        SessionEventKind::ExpiringSoon,
        SessionEventKind::Expired,
        SessionEventKind::Refreshed,
    ] {
        let sink = Arc::clone(&log);
        bus.subscribe(kind, move |e| sink.lock().unwrap().push(e.clone()));
    }
    log
}
