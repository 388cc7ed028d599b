use std::collections::BTreeMap;
use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;

use crate::dispatch::ModelInfo;
use crate::error::RelayError;
use crate::relay::{ActiveResponse, GenerateRequest, Multiplexer};

#[derive(Clone)]
pub struct AppState {
    relay: Multiplexer,
}

pub fn router(relay: Multiplexer) -> Router {
    Router::new()
        .route("/api/chat/generate", post(generate))
        .route("/api/chat/active_responses", get(active_responses))
        .route("/api/chat/stop", post(stop))
        .route("/api/chat/:conversation_id/title", post(title))
        .route("/api/models", get(models))
        .with_state(AppState { relay })
}

#[derive(Debug, Deserialize)]
pub struct GeneratePayload {
    #[serde(default)]
    pub message: String,
    pub model: String,
    pub conversation_id: String,
    pub user_id: Option<String>,
    /// Base64-encoded image.
    pub image: Option<String>,
    #[serde(default)]
    pub web_search: bool,
    pub message_id: Option<String>,
}

async fn generate(State(state): State<AppState>, Json(payload): Json<GeneratePayload>) -> Response {
    let message_id = payload
        .message_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let req = GenerateRequest {
        message_id,
        prompt: payload.message,
        conversation_id: payload.conversation_id,
        model: payload.model,
        attachment: payload.image.filter(|img| !img.is_empty()),
        user_id: payload.user_id.filter(|u| !u.is_empty()),
        web_search: payload.web_search,
    };

    let lines = state
        .relay
        .generate(req)
        .map(|event| Ok::<_, Infallible>(event.to_ndjson()));

    (
        [
            (CONTENT_TYPE, "application/x-ndjson"),
            (CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(lines),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ActiveQuery {
    pub user_id: Option<String>,
}

async fn active_responses(
    State(state): State<AppState>,
    Query(query): Query<ActiveQuery>,
) -> Json<BTreeMap<String, ActiveResponse>> {
    let active = state
        .relay
        .running(query.user_id.as_deref())
        .into_iter()
        .map(|a| (a.message_id.clone(), a))
        .collect();
    Json(active)
}

#[derive(Debug, Deserialize)]
pub struct StopPayload {
    pub message_id: String,
}

async fn stop(
    State(state): State<AppState>,
    Json(payload): Json<StopPayload>,
) -> Json<serde_json::Value> {
    let success = state.relay.stop(&payload.message_id).await;
    Json(json!({ "success": success }))
}

async fn title(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let title = state.relay.name_conversation(&conversation_id).await?;
    Ok(Json(json!({ "title": title })))
}

async fn models(State(state): State<AppState>) -> Json<Vec<ModelInfo>> {
    Json(state.relay.provider().models())
}

/// `RelayError` rendered as `{"error": …}` with a fitting status code.
pub struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::NotFound(_) | RelayError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            RelayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::ProviderUnavailable { .. } | RelayError::Config(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RelayError::Store(_) | RelayError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.user_message() }))).into_response()
    }
}
