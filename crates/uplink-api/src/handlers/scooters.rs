//! /scooters handlers — session listing, state and event queries.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::{Map, Value};

use uplink_store::{EventRecord, SessionStats};

use super::{ApiError, ApiState};

/// Most events a single query returns.
const EVENTS_QUERY_LIMIT: usize = 100;

// ── /scooters (GET) ───────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ScooterListResponse {
    pub scooters: Vec<SessionStats>,
    pub total: usize,
}

pub async fn handle_list_scooters(State(state): State<ApiState>) -> Json<ScooterListResponse> {
    let scooters: Vec<SessionStats> = state.registry.list().iter().map(|s| s.stats()).collect();
    let total = scooters.len();
    Json(ScooterListResponse { scooters, total })
}

// ── /scooters/:id (GET) ───────────────────────────────────────────────────────

pub async fn handle_scooter_detail(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SessionStats>, ApiError> {
    let session = state
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::not_found("scooter not connected"))?;
    Ok(Json(session.stats()))
}

// ── /scooters/:id/state (GET) ─────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ScooterStateResponse {
    pub scooter_id: String,
    pub state: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub async fn handle_scooter_state(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<ScooterStateResponse>, ApiError> {
    if state.registry.get(&id).is_none() {
        return Err(ApiError::not_found("scooter not connected"));
    }

    match state.states.get(&id) {
        Some(peer_state) => Ok(Json(ScooterStateResponse {
            scooter_id: id,
            state: peer_state.state,
            last_updated: Some(
                peer_state
                    .last_updated
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            message: None,
        })),
        None => Ok(Json(ScooterStateResponse {
            scooter_id: id,
            state: Map::new(),
            last_updated: None,
            message: Some("no state data available yet".to_string()),
        })),
    }
}

// ── /scooters/:id/events (GET) ────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ScooterEventsResponse {
    pub scooter_id: String,
    pub events: Vec<EventRecord>,
    pub total: usize,
}

pub async fn handle_scooter_events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<ScooterEventsResponse>, ApiError> {
    if state.registry.get(&id).is_none() {
        return Err(ApiError::not_found("scooter not connected"));
    }

    let events = state.events.list(&id, EVENTS_QUERY_LIMIT);
    let total = events.len();
    Ok(Json(ScooterEventsResponse {
        scooter_id: id,
        events,
        total,
    }))
}

// ── /scooters/:id/events (DELETE) ─────────────────────────────────────────────

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

pub async fn handle_clear_events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    if state.registry.get(&id).is_none() {
        return Err(ApiError::not_found("scooter not connected"));
    }

    state.events.clear(&id);
    tracing::info!(identifier = %id, "events cleared via API");
    Ok(Json(MessageResponse {
        message: "all events cleared".to_string(),
    }))
}

// ── /scooters/:id/events/:event_id (DELETE) ───────────────────────────────────

pub async fn handle_delete_event(
    State(state): State<ApiState>,
    Path((id, event_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    if state.registry.get(&id).is_none() {
        return Err(ApiError::not_found("scooter not connected"));
    }

    if !state.events.delete(&id, &event_id) {
        return Err(ApiError::not_found("event not found"));
    }

    Ok((
        StatusCode::OK,
        Json(MessageResponse {
            message: "event deleted".to_string(),
        }),
    ))
}
