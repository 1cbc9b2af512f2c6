//! uplink-api — the operator REST surface.
//!
//! Every route requires the shared API key in `X-API-Key`. Errors are
//! JSON bodies of the form `{"error": "..."}`.

pub mod handlers;

use axum::http::{header, HeaderName, Method};
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// Build the `/api` router. The caller nests it under its path prefix.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static("x-api-key")]);

    Router::new()
        .route("/scooters", get(handlers::handle_list_scooters))
        .route("/scooters/{id}", get(handlers::handle_scooter_detail))
        .route("/scooters/{id}/state", get(handlers::handle_scooter_state))
        .route(
            "/scooters/{id}/events",
            get(handlers::handle_scooter_events).delete(handlers::handle_clear_events),
        )
        .route(
            "/scooters/{id}/events/{event_id}",
            delete(handlers::handle_delete_event),
        )
        .route(
            "/scooters/{id}/commands",
            get(handlers::handle_scooter_commands),
        )
        .route("/commands", post(handlers::handle_send_command))
        .route("/commands/{request_id}", get(handlers::handle_command_result))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::require_api_key,
        ))
        .layer(cors)
        .with_state(state)
}
