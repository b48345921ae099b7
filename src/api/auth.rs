//! Session endpoints: login, logout and the current user's profile.

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::decode_ack;
use super::decode_envelope;
use super::error::ApiError;

/// Account record as returned by the auth endpoints.
#[derive(Debug, Deserialize, Clone)]
pub struct User {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Token plus the account it belongs to.
#[derive(Debug, Deserialize)]
pub struct LoginData {
    pub token: String,
    pub user: User,
}

#[derive(Deserialize)]
struct ProfileData {
    user: User,
}

/// Exchange credentials for a bearer token.
pub async fn login(
    client: &Client,
    base_url: &str,
    username: &str,
    password: &str,
) -> Result<LoginData, ApiError> {
    let response = client
        .post(format!("{}/api/v1/auth/login", base_url))
        .json(&LoginRequest { username, password })
        .send()
        .await?;

    decode_envelope(response).await
}

/// Invalidate the current token server-side. Returns the backend's
/// acknowledgement message.
pub async fn logout(client: &Client, base_url: &str, token: &str) -> Result<String, ApiError> {
    if token.is_empty() {
        return Err(ApiError::NotAuthenticated);
    }

    let response = client
        .post(format!("{}/api/v1/auth/logout", base_url))
        .bearer_auth(token)
        .send()
        .await?;

    decode_ack(response).await
}

/// Fetch the account behind the current token.
pub async fn profile(client: &Client, base_url: &str, token: &str) -> Result<User, ApiError> {
    if token.is_empty() {
        return Err(ApiError::NotAuthenticated);
    }

    let response = client
        .get(format!("{}/api/v1/auth/profile", base_url))
        .bearer_auth(token)
        .send()
        .await?;

    let data: ProfileData = decode_envelope(response).await?;
    Ok(data.user)
}
