//! Webhook ingestion endpoint.
//!
//! Accepts third-party deliveries on `POST /hooks/{*path}`, validates the
//! shared secret, wraps the body into an occurrence payload, and forwards
//! it to the execution pipeline. Returns 202 as soon as the occurrence is
//! recorded; job execution happens asynchronously in the workers.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::pipeline::{ExecutionInput, PipelineError};
use crate::store::StoreError;
use crate::types::JsonMap;

use super::secret::secrets_match;
use super::AppState;

/// Header carrying the shared webhook secret.
pub const HEADER_SECRET: &str = "x-area-webhook-secret";
/// Optional dedup key supplied by the caller.
pub const HEADER_EVENT_ID: &str = "x-area-event-id";
/// Optional RFC 3339 occurrence time supplied by the caller.
pub const HEADER_EVENT_TIME: &str = "x-area-event-time";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook not found")]
    UnknownPath,

    #[error("webhook secret missing")]
    SecretMissing,

    #[error("webhook secret invalid")]
    SecretInvalid,

    #[error("invalid request payload")]
    InvalidPayload,

    #[error("webhook processing failed")]
    Internal,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::UnknownPath => StatusCode::NOT_FOUND,
            WebhookError::SecretMissing => StatusCode::UNAUTHORIZED,
            WebhookError::SecretInvalid => StatusCode::FORBIDDEN,
            WebhookError::InvalidPayload => StatusCode::BAD_REQUEST,
            WebhookError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, axum::Json(json!({"error": self.to_string()}))).into_response()
    }
}

/// Webhook handler for `POST /hooks/{*path}`.
///
/// # Response
///
/// - 202 Accepted: occurrence recorded (or deduplicated)
/// - 400 Bad Request: body claims JSON but does not parse as an object
/// - 401 Unauthorized: secret header absent
/// - 403 Forbidden: secret mismatch
/// - 404 Not Found: no webhook source mounted at this path
pub async fn webhook_handler(
    State(app_state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, WebhookError> {
    let path = path.trim_matches('/').to_owned();
    if path.is_empty() {
        return Err(WebhookError::UnknownPath);
    }

    let binding = match app_state.sources().find_webhook_binding(&path).await {
        Ok(binding) => binding,
        Err(StoreError::NotFound) => return Err(WebhookError::UnknownPath),
        Err(e) => {
            warn!(error = %e, "webhook binding lookup failed");
            return Err(WebhookError::Internal);
        }
    };

    // Authenticate before touching the body.
    let provided = header_str(&headers, HEADER_SECRET).trim();
    if provided.is_empty() {
        return Err(WebhookError::SecretMissing);
    }
    let expected = binding.source.webhook_secret.trim();
    if expected.is_empty() || !secrets_match(expected, provided) {
        return Err(WebhookError::SecretInvalid);
    }

    let mut payload = decode_payload(&headers, &body)?;
    if !query.is_empty() {
        payload.insert("query".into(), query_to_json(&query));
    }
    payload.insert("headers".into(), headers_to_json(&headers));

    let fingerprint = header_str(&headers, HEADER_EVENT_ID).trim().to_owned();
    let occurred_at = parse_event_time(header_str(&headers, HEADER_EVENT_TIME))
        .unwrap_or_else(|| app_state.clock().now());

    debug!(path = %path, source_id = %binding.source.id, "webhook delivery accepted");

    let input = ExecutionInput {
        source_id: binding.source.id,
        user_id: binding.user_id,
        fingerprint: fingerprint.clone(),
        payload,
        occurred_at,
    };
    match app_state.executor().execute_area(binding.area_id, input).await {
        Ok(()) => {}
        Err(PipelineError::NotOwned) => return Err(WebhookError::SecretInvalid),
        Err(e) => {
            warn!(path = %path, error = %e, "webhook processing failed");
            return Err(WebhookError::Internal);
        }
    }

    // Best-effort receipt bookkeeping on the source cursor.
    let mut cursor = binding.source.cursor.clone();
    cursor.insert(
        "last_received".into(),
        json!(app_state.clock().now().to_rfc3339()),
    );
    if !fingerprint.is_empty() {
        cursor.insert("last_fingerprint".into(), json!(fingerprint));
    }
    if let Err(e) = app_state
        .sources()
        .update_cursor(binding.source.id, cursor)
        .await
    {
        warn!(source_id = %binding.source.id, error = %e, "webhook cursor update failed");
    }

    Ok(StatusCode::ACCEPTED)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// JSON bodies become the payload object; anything else is wrapped under a
/// `body` key so no delivery is dropped for its content type.
fn decode_payload(headers: &HeaderMap, body: &Bytes) -> Result<JsonMap, WebhookError> {
    let content_type = header_str(headers, "content-type").to_ascii_lowercase();
    if content_type.contains("application/json") {
        if body.is_empty() {
            return Ok(JsonMap::new());
        }
        return match serde_json::from_slice::<serde_json::Value>(body) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            _ => Err(WebhookError::InvalidPayload),
        };
    }

    let mut payload = JsonMap::new();
    if !body.is_empty() {
        payload.insert(
            "body".into(),
            json!(String::from_utf8_lossy(body).into_owned()),
        );
    }
    Ok(payload)
}

fn query_to_json(query: &[(String, String)]) -> serde_json::Value {
    let mut map = JsonMap::new();
    for (key, value) in query {
        match map.get_mut(key) {
            None => {
                map.insert(key.clone(), json!(value));
            }
            Some(serde_json::Value::Array(values)) => values.push(json!(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = json!([first, value]);
            }
        }
    }
    serde_json::Value::Object(map)
}

/// All request headers except the secret, which never lands in a payload.
fn headers_to_json(headers: &HeaderMap) -> serde_json::Value {
    let mut map = JsonMap::new();
    for (name, value) in headers {
        if name.as_str().eq_ignore_ascii_case(HEADER_SECRET) {
            continue;
        }
        let Ok(value) = value.to_str() else { continue };
        match map.get_mut(name.as_str()) {
            None => {
                map.insert(name.as_str().to_owned(), json!(value));
            }
            Some(serde_json::Value::Array(values)) => values.push(json!(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = json!([first, value]);
            }
        }
    }
    serde_json::Value::Object(map)
}

fn parse_event_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
