//! Authentication for the ERP API
//!
//! Sign-in exchanges a username/password for an access/renewal token pair;
//! the pair is kept in the session's token store and renewed on demand.

pub mod jwt;
pub mod refresh;
pub mod tokens;

use serde::Serialize;

pub use refresh::{RefreshCoordinator, TokenResponse};
pub use tokens::{Credentials, MemoryStorage, TokenStorage, TokenStore};

use crate::api::{ApiClient, ApiError, RequestOptions};
use crate::session::Session;

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Authenticate and store the returned credential pair.
pub async fn sign_in(
    client: &ApiClient,
    login_path: &str,
    username: &str,
    password: &str,
) -> Result<(), ApiError> {
    tracing::info!("Signing in as {}", username);

    let response: TokenResponse = client
        .post(
            login_path,
            &LoginRequest { username, password },
            &RequestOptions::new(),
        )
        .await?;

    let access_token = response
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::decode(None, "Sign-in response missing accessToken"))?;

    client.session().tokens().save(Credentials {
        access_token: Some(access_token),
        refresh_token: response.refresh_token,
    });
    tracing::info!("Signed in");
    Ok(())
}

/// Forget the stored credentials and stop expiry timers.
pub fn sign_out(session: &Session) {
    session.tokens().clear();
    tracing::info!("Signed out");
}
