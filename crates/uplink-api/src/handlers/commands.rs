//! /commands handlers — command dispatch and parked-response lookup.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use uplink_store::{CommandError, ResponseRecord};

use super::{ApiError, ApiState};

// ── /commands (POST) ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SendCommandRequest {
    #[serde(default)]
    pub scooter_id: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Serialize)]
pub struct SendCommandResponse {
    pub request_id: String,
    pub status: String,
    pub message: String,
}

pub async fn handle_send_command(
    State(state): State<ApiState>,
    Json(request): Json<SendCommandRequest>,
) -> Result<(StatusCode, Json<SendCommandResponse>), ApiError> {
    if request.scooter_id.is_empty() || request.command.is_empty() {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            "scooter_id and command are required".to_string(),
        ));
    }

    let request_id = state
        .commands
        .send(&request.scooter_id, &request.command, request.params)
        .map_err(|e| match e {
            CommandError::NotConnected(_) | CommandError::NotAuthenticated(_) => {
                ApiError::not_found("scooter not connected")
            }
            CommandError::Backpressure(_) => ApiError(
                StatusCode::SERVICE_UNAVAILABLE,
                "outbound queue full, try again later".to_string(),
            ),
        })?;

    Ok((
        StatusCode::CREATED,
        Json(SendCommandResponse {
            request_id,
            status: "sent".to_string(),
            message: "command sent successfully".to_string(),
        }),
    ))
}

// ── /commands/:request_id (GET) ───────────────────────────────────────────────

fn record_json(record: &ResponseRecord) -> Value {
    let mut body = Map::new();
    body.insert("request_id".to_string(), json!(record.request_id));
    body.insert("scooter_id".to_string(), json!(record.scooter_id));
    body.insert("status".to_string(), json!(record.response.status));
    body.insert(
        "received_at".to_string(),
        json!(record.received_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );

    if !record.command.is_empty() {
        body.insert("command".to_string(), json!(record.command));
    }
    if let Some(result) = &record.response.result {
        body.insert("result".to_string(), Value::Object(result.clone()));
    }
    if !record.response.error.is_empty() {
        body.insert("error".to_string(), json!(record.response.error));
    }
    Value::Object(body)
}

pub async fn handle_command_result(
    State(state): State<ApiState>,
    Path(request_id): Path<String>,
) -> Json<Value> {
    match state.commands.result(&request_id) {
        Some(record) => Json(record_json(&record)),
        None => Json(json!({
            "request_id": request_id,
            "status": "pending",
            "message": "response not yet received",
        })),
    }
}

// ── /scooters/:id/commands (GET) ──────────────────────────────────────────────

pub async fn handle_scooter_commands(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.registry.get(&id).is_none() {
        return Err(ApiError::not_found("scooter not connected"));
    }

    let commands: Vec<Value> = state
        .commands
        .results_for(&id)
        .iter()
        .map(record_json)
        .collect();

    Ok(Json(json!({
        "scooter_id": id,
        "total": commands.len(),
        "commands": commands,
    })))
}
