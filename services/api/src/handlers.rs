//! Axum Handlers for the HTTP API
//!
//! The browser client page, backend availability and a health probe. Uses
//! `utoipa` doc comments to generate OpenAPI documentation.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Json, Response},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::error;
use utoipa::ToSchema;

use crate::{bootstrap::ModelAvailability, state::AppState};

const CLIENT_PAGE: &str = include_str!("../static/websocket_client.html");
const WS_BASE_URL_PLACEHOLDER: &str = "WS_BASE_URL_PLACEHOLDER";
const AVAILABLE_MODELS_PLACEHOLDER: &str = "AVAILABLE_MODELS_PLACEHOLDER";

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

pub enum ApiError {
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Whether a `Host` header value is a plain `host[:port]`, safe to embed in the page.
fn is_valid_host(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 255
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'))
}

/// Picks the host the client page should connect back to.
fn page_host<'a>(requested: Option<&'a str>, fallback: &'a str) -> &'a str {
    requested.filter(|host| is_valid_host(host)).unwrap_or(fallback)
}

/// Fills the client page's placeholders for the host the browser used.
pub fn render_client_page(host: &str, availability: &ModelAvailability) -> anyhow::Result<String> {
    let models = serde_json::to_string(availability)?;
    Ok(CLIENT_PAGE
        .replace(WS_BASE_URL_PLACEHOLDER, &format!("ws://{host}"))
        .replace(AVAILABLE_MODELS_PLACEHOLDER, &models))
}

/// Serve the browser test client.
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "The browser client page", content_type = "text/html"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn index(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Html<String>, ApiError> {
    let fallback_host = state.config.bind_address.to_string();
    let requested = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    let host = page_host(requested, &fallback_host);
    let page = render_client_page(host, &state.models.availability())?;
    Ok(Html(page))
}

/// Which backends have credentials configured.
#[utoipa::path(
    get,
    path = "/models",
    responses(
        (status = 200, description = "Availability per backend", body = ModelAvailability)
    )
)]
pub async fn models(State(state): State<Arc<AppState>>) -> Json<ModelAvailability> {
    Json(state.models.availability())
}

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "The server is up", body = HealthResponse)
    )
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}
