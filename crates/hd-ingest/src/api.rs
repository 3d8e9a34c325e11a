//! Ingest REST API.
//!
//! `POST /notifications` and `POST /notifications/batch` accept send
//! requests; `POST /notifications/{id}/retry` is the admin retry contract.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::ApiKeyAuth;
use crate::error::IngestError;
use crate::service::IngestService;
use crate::validation;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<IngestService>,
    pub auth: Arc<ApiKeyAuth>,
}

/// Single send request. `channel` fans out to one notification per channel.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub request_id: String,
    pub client_id: String,
    pub channel: Vec<String>,
    pub recipient: RecipientPayload,
    pub content: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub webhook_url: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub provider: Option<ProviderHint>,
}

/// Batch send request: same shape, except each recipient carries its own
/// request id. Fans out to one notification per (recipient, channel).
#[derive(Debug, Clone, Deserialize)]
pub struct BatchSubmitRequest {
    pub client_id: String,
    pub channel: Vec<String>,
    pub recipients: Vec<BatchRecipient>,
    pub content: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub webhook_url: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub provider: Option<ProviderHint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecipientPayload {
    pub user_id: String,
    /// Channel-keyed delivery fields (e.g. `email`, `telegram`).
    #[serde(flatten)]
    pub fields: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRecipient {
    pub request_id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub fields: HashMap<String, serde_json::Value>,
}

/// Provider hint: a single name or an ordered preference list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProviderHint {
    One(String),
    Many(Vec<String>),
}

impl ProviderHint {
    pub fn first(&self) -> Option<&str> {
        match self {
            ProviderHint::One(name) => Some(name.as_str()),
            ProviderHint::Many(names) => names.first().map(String::as_str),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub message: String,
    pub count: u64,
}

pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/notifications", post(submit_single))
        .route("/notifications/batch", post(submit_batch))
        .route("/notifications/{id}/retry", post(retry_notification))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(authed)
        .route("/healthz", get(healthz))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if !state.auth.verify(authorization) {
        return IngestError::Unauthorized.into_response();
    }

    next.run(request).await
}

async fn submit_single(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<impl IntoResponse, IngestError> {
    validation::validate_submit(&request).map_err(|e| {
        metrics::counter!("ingest.validation_failed_total").increment(1);
        IngestError::Validation(e)
    })?;

    let count = state.service.submit_single(request).await?;

    metrics::counter!("ingest.accepted_total").increment(count);
    info!(count = count, "Accepted notification request");

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            message: "accepted".to_string(),
            count,
        }),
    ))
}

async fn submit_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchSubmitRequest>,
) -> Result<impl IntoResponse, IngestError> {
    validation::validate_batch(&request).map_err(|e| {
        metrics::counter!("ingest.validation_failed_total").increment(1);
        IngestError::Validation(e)
    })?;

    let count = state.service.submit_batch(request).await?;

    metrics::counter!("ingest.accepted_total").increment(count);
    info!(count = count, "Accepted batch notification request");

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            message: "accepted".to_string(),
            count,
        }),
    ))
}

/// Admin retry: resets a failed notification to pending and re-enqueues it.
async fn retry_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, IngestError> {
    state.service.retry_failed(&id).await?;

    metrics::counter!("ingest.admin_retries_total").increment(1);
    info!(notification_id = %id, "Reset failed notification for retry");

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            message: "retry accepted".to_string(),
            count: 1,
        }),
    ))
}

async fn healthz(State(state): State<AppState>) -> Response {
    match state.service.ping().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "UP" }))).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "DOWN", "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_hint_accepts_string_or_list() {
        let one: ProviderHint = serde_json::from_str("\"ses\"").unwrap();
        assert_eq!(one.first(), Some("ses"));

        let many: ProviderHint = serde_json::from_str("[\"ses\", \"smtp\"]").unwrap();
        assert_eq!(many.first(), Some("ses"));

        let empty: ProviderHint = serde_json::from_str("[]").unwrap();
        assert_eq!(empty.first(), None);
    }

    #[test]
    fn recipient_flattens_channel_fields() {
        let recipient: RecipientPayload = serde_json::from_str(
            r#"{"user_id": "u1", "email": "a@example.com", "telegram": "12345"}"#,
        )
        .unwrap();
        assert_eq!(recipient.user_id, "u1");
        assert_eq!(recipient.fields["email"], "a@example.com");
        assert_eq!(recipient.fields["telegram"], "12345");
    }
}
