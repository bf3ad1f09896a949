//! Axum Router Configuration
//!
//! HTTP routes, the relay WebSocket endpoint and the OpenAPI documentation.

use crate::{
    bootstrap::ModelAvailability,
    handlers::{self, ErrorResponse, HealthResponse},
    state::AppState,
    ws::{self, ws_handler},
};

use axum::{Router, routing::get};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::index,
        handlers::models,
        handlers::health,
        ws::session::ws_handler,
    ),
    components(
        schemas(ModelAvailability, HealthResponse, ErrorResponse)
    ),
    tags(
        (name = "Bidi Relay", description = "Bidirectional voice relay between browsers and realtime speech backends")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/", get(handlers::index))
        .route("/models", get(handlers::models))
        .route("/health", get(handlers::health))
        .route("/ws/{model_name}", get(ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
