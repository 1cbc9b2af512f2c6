//! REST handlers — exposes the stores and command router as JSON.

pub mod commands;
pub mod scooters;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use uplink_store::{CommandRouter, ConnectionRegistry, EventStore, StateStore};

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<ConnectionRegistry>,
    pub commands: CommandRouter,
    pub states: Arc<StateStore>,
    pub events: Arc<EventStore>,
    pub api_key: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Error response carrying the status code and a JSON `{error}` body.
pub struct ApiError(pub StatusCode, pub String);

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self(StatusCode::NOT_FOUND, message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody { error: self.1 })).into_response()
    }
}

/// Reject requests without the shared API key.
pub async fn require_api_key(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());
    if presented != Some(state.api_key.as_str()) {
        return ApiError(
            StatusCode::UNAUTHORIZED,
            "invalid or missing API key".to_string(),
        )
        .into_response();
    }
    next.run(request).await
}

// Re-export handler functions for router setup.
pub use commands::{handle_command_result, handle_scooter_commands, handle_send_command};
pub use scooters::{
    handle_clear_events, handle_delete_event, handle_list_scooters, handle_scooter_detail,
    handle_scooter_events, handle_scooter_state,
};
