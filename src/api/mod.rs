//! Client for the deployment backend's REST API.

pub mod auth;
pub mod deployments;
pub mod error;
pub mod models;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use error::ApiError;
use models::ApiEnvelope;

/// Decode a successful envelope's `data`, or map the failure to a typed
/// error. Error bodies are envelopes too; fall back to the raw body when
/// they do not parse.
pub(crate) async fn decode_envelope<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ApiError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(failure_from(status, body));
    }

    let envelope: ApiEnvelope<T> =
        serde_json::from_str(&body).map_err(|err| ApiError::Decode(err.to_string()))?;
    envelope
        .data
        .ok_or_else(|| ApiError::Decode("envelope carried no data".to_string()))
}

/// Decode an envelope that acknowledges an action without returning data,
/// yielding the backend's message line.
pub(crate) async fn decode_ack(response: reqwest::Response) -> Result<String, ApiError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(failure_from(status, body));
    }

    let envelope: ApiEnvelope<serde_json::Value> =
        serde_json::from_str(&body).map_err(|err| ApiError::Decode(err.to_string()))?;
    Ok(envelope.message)
}

fn failure_from(status: StatusCode, body: String) -> ApiError {
    let message = serde_json::from_str::<ApiEnvelope<serde_json::Value>>(&body)
        .map(|envelope| envelope.message)
        .unwrap_or(body);

    match status {
        StatusCode::BAD_REQUEST => ApiError::InvalidState(message),
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
        StatusCode::NOT_FOUND => ApiError::NotFound(message),
        _ => ApiError::Server {
            status: status.as_u16(),
            message,
        },
    }
}
