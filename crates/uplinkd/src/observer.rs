//! Observer sessions — read-only operator connections on `/ws/web`.
//!
//! After the upgrade the observer receives, in order: the scooter list
//! (connected peers plus those with only persisted state), a full
//! state update per persisted peer, the persisted events oldest-first
//! (a prepending UI ends up newest-first), and from then on live
//! state, event and presence updates. A single broadcaster task
//! multiplexes the three subscriptions so socket writes stay
//! serialized.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{SecondsFormat, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use uplink_store::{EventRecord, Presence, Session, StateUpdate};

use crate::DaemonState;

#[derive(Deserialize)]
pub struct ObserverQuery {
    api_key: Option<String>,
}

pub async fn handle_ws_web(
    State(state): State<DaemonState>,
    Query(query): Query<ObserverQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.api_key);
    if presented.as_deref() != Some(state.api_key.as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| observer_connection(state, socket))
        .into_response()
}

/// Frame sent to observers. Empty and absent fields are omitted.
#[derive(Debug, Default, Serialize)]
struct WebMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    scooters: Option<Vec<ScooterInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scooter: Option<ScooterInfo>,
    #[serde(skip_serializing_if = "String::is_empty")]
    scooter_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    update_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    event: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_data: Option<Map<String, Value>>,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes_sent: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes_received: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wire_bytes_sent: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wire_bytes_received: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    telemetry_received: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    commands_sent: Option<u64>,
}

#[derive(Debug, Default, Serialize)]
struct ScooterInfo {
    identifier: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    name: String,
    connected: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    version: String,
    uptime_seconds: u64,
    bytes_sent: u64,
    bytes_received: u64,
    wire_bytes_sent: u64,
    wire_bytes_received: u64,
    telemetry_received: u64,
    commands_sent: u64,
}

impl ScooterInfo {
    fn from_session(session: &Session) -> Self {
        let stats = session.stats();
        Self {
            identifier: stats.identifier,
            name: stats.name,
            connected: true,
            version: stats.version,
            uptime_seconds: stats.uptime_seconds,
            bytes_sent: stats.bytes_sent,
            bytes_received: stats.bytes_received,
            wire_bytes_sent: stats.wire_bytes_sent,
            wire_bytes_received: stats.wire_bytes_received,
            telemetry_received: stats.telemetry_received,
            commands_sent: stats.commands_sent,
        }
    }

    fn disconnected(identifier: String, name: String, version: String) -> Self {
        Self {
            identifier,
            name,
            connected: false,
            version,
            ..Default::default()
        }
    }
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

async fn observer_connection(state: DaemonState, socket: WebSocket) {
    tracing::info!("observer connected");
    let (mut sink, mut stream) = socket.split();

    // Subscribe before the snapshot so no live update is missed.
    let (state_rx, state_sub) = state.states.subscribe();
    let (event_rx, event_sub) = state.events.subscribe();
    let (presence_rx, presence_sub) = state.registry.subscribe();
    let cancel = state.shutdown.child_token();

    if send_initial(&state, &mut sink).await.is_ok() {
        state.tracker.spawn(broadcaster(
            state.clone(),
            sink,
            state_rx,
            event_rx,
            presence_rx,
            cancel.clone(),
        ));

        // Observers send nothing meaningful; the read loop only
        // detects disconnection.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = stream.next() => match received {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    cancel.cancel();
    state.states.unsubscribe(state_sub);
    state.events.unsubscribe(event_sub);
    state.registry.unsubscribe(presence_sub);
    tracing::info!("observer disconnected");
}

async fn send(sink: &mut SplitSink<WebSocket, Message>, msg: &WebMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).map_err(axum::Error::new)?;
    sink.send(Message::Text(text.into())).await
}

async fn send_initial(
    state: &DaemonState,
    sink: &mut SplitSink<WebSocket, Message>,
) -> Result<(), axum::Error> {
    let all_states = state.states.all();

    // Scooter list: connected sessions first, then peers known only
    // from persisted state.
    let mut scooters = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for session in state.registry.list() {
        seen.insert(session.identifier().to_string());
        scooters.push(ScooterInfo::from_session(&session));
    }
    for (identifier, peer_state) in &all_states {
        if !seen.contains(identifier) {
            scooters.push(ScooterInfo::disconnected(
                identifier.clone(),
                state.auth.name(identifier),
                peer_state.version.clone(),
            ));
        }
    }

    send(
        sink,
        &WebMessage {
            kind: "scooter_list",
            scooters: Some(scooters),
            timestamp: now_timestamp(),
            ..Default::default()
        },
    )
    .await?;

    // One full state update per persisted peer.
    for (identifier, peer_state) in &all_states {
        send(
            sink,
            &WebMessage {
                kind: "state_update",
                scooter_id: identifier.clone(),
                state: Some(peer_state.state.clone()),
                update_type: "full".to_string(),
                timestamp: now_timestamp(),
                ..Default::default()
            },
        )
        .await?;
    }

    // Persisted events, oldest-first per peer.
    for events in state.events.all().values() {
        for record in events.iter().rev() {
            send(sink, &event_message(record)).await?;
        }
    }

    Ok(())
}

fn event_message(record: &EventRecord) -> WebMessage {
    WebMessage {
        kind: "event",
        scooter_id: record.scooter_id.clone(),
        event: record.event.clone(),
        event_id: record.id.clone(),
        event_data: record.data.clone(),
        timestamp: record
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        ..Default::default()
    }
}

fn state_update_message(state: &DaemonState, update: StateUpdate) -> WebMessage {
    let mut msg = WebMessage {
        kind: "state_update",
        scooter_id: update.scooter_id.clone(),
        state: Some(update.state),
        update_type: update.kind.as_str().to_string(),
        timestamp: update
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        ..Default::default()
    };

    // Live counters ride along while the peer is connected.
    if let Some(session) = state.registry.get(&update.scooter_id) {
        msg.bytes_sent = Some(session.bytes_sent());
        msg.bytes_received = Some(session.bytes_received());
        msg.telemetry_received = Some(session.telemetry_received());
        msg.commands_sent = Some(session.commands_sent());
        msg.wire_bytes_sent = Some(session.meter().bytes_written());
        msg.wire_bytes_received = Some(session.meter().bytes_read());
    }
    msg
}

fn presence_message(presence: Presence) -> WebMessage {
    match presence {
        Presence::Online(session) => WebMessage {
            kind: "scooter_online",
            scooter: Some(ScooterInfo::from_session(&session)),
            timestamp: now_timestamp(),
            ..Default::default()
        },
        Presence::Offline(identifier) => WebMessage {
            kind: "scooter_offline",
            scooter_id: identifier,
            timestamp: now_timestamp(),
            ..Default::default()
        },
    }
}

/// Multiplex the three subscriptions onto the observer socket. Exits
/// on any write error or cancellation.
async fn broadcaster(
    state: DaemonState,
    mut sink: SplitSink<WebSocket, Message>,
    mut state_rx: mpsc::Receiver<StateUpdate>,
    mut event_rx: mpsc::Receiver<EventRecord>,
    mut presence_rx: mpsc::Receiver<Presence>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            update = state_rx.recv() => match update {
                Some(update) => state_update_message(&state, update),
                None => return,
            },
            event = event_rx.recv() => match event {
                Some(event) => event_message(&event),
                None => return,
            },
            presence = presence_rx.recv() => match presence {
                Some(presence) => presence_message(presence),
                None => return,
            },
        };

        if let Err(e) = send(&mut sink, &msg).await {
            tracing::debug!(error = %e, "observer write failed");
            cancel.cancel();
            return;
        }
    }
}
