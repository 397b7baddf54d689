//! Dashboard surface: WebSocket event stream plus REST endpoints.

pub mod routes;
pub mod ws;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, warn};

use crate::error::PipelineError;
use crate::pipeline::Pipeline;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

/// Build the Axum router with the WebSocket and REST routes.
pub fn dashboard_routes(pipeline: Arc<Pipeline>) -> Router {
    let state = AppState { pipeline };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health))
        .route("/ws", get(ws::ws_handler))
        .route("/api/status", get(routes::status))
        .route("/api/discovery", post(routes::start_discovery))
        .route("/api/leads", get(routes::list_leads))
        .route("/api/leads/{id}", get(routes::get_lead))
        .route("/api/leads/{id}/research", post(routes::research))
        .route("/api/leads/{id}/proposal", post(routes::proposal))
        .route("/api/leads/{id}/outreach", post(routes::outreach))
        .route("/api/leads/{id}/converting", post(routes::mark_converting))
        .route("/api/leads/{id}/confirm", post(routes::confirm))
        .route("/api/leads/{id}/reject", post(routes::reject))
        .route("/api/leads/{id}/no_response", post(routes::mark_no_response))
        .route("/api/leads/{id}/notes", post(routes::add_note))
        .route("/api/leads/{id}/classification", post(routes::submit_classification))
        .route("/api/leads/{id}/schedule_meeting", post(routes::schedule_meeting))
        .route("/api/inbound_email", post(routes::inbound_email))
        .route("/agent_callback", post(routes::agent_callback))
        .route(
            "/api/human-input",
            get(routes::list_human_input).post(routes::request_human_input),
        )
        .route("/api/human-input/{request_id}", post(routes::resolve_human_input))
        .route(
            "/api/human-input/{request_id}/cancel",
            post(routes::cancel_human_input),
        )
        .route("/api/activity", get(routes::activity))
        .route("/reset", post(routes::reset))
        .layer(cors)
        .with_state(state)
}

/// `PipelineError` rendered as `{"error": "..."}` with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            PipelineError::NotFound { .. } => StatusCode::NOT_FOUND,
            PipelineError::InvalidTransition { .. }
            | PipelineError::AlreadyPending { .. }
            | PipelineError::Busy(_) => StatusCode::CONFLICT,
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::External(_) => StatusCode::BAD_GATEWAY,
            PipelineError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(status = %status, error = %self.0, "Request failed");
        } else {
            warn!(status = %status, error = %self.0, "Request rejected");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}
