//! Peer connections — handshake, framed read/write, keepalive.
//!
//! Each authenticated peer runs three cooperative tasks: the reader
//! (this request task), a writer owning the sink half, and a keeper on
//! the keepalive interval. Termination is signaled through the
//! session's cancellation token; the outbound queue is never closed by
//! the terminator, only observed by the writer.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, State};
use axum::response::Response;
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use uplink_core::protocol::{ClientFrame, ServerFrame};
use uplink_store::{Session, WireMeter};

use crate::DaemonState;

pub async fn handle_ws(
    State(state): State<DaemonState>,
    Extension(meter): Extension<Arc<WireMeter>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| peer_connection(state, socket, meter))
}

/// JSON payload of a data frame; None for control frames.
fn frame_payload(msg: &Message) -> Option<&[u8]> {
    match msg {
        Message::Text(text) => Some(text.as_str().as_bytes()),
        Message::Binary(data) => Some(data.as_ref()),
        _ => None,
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).map_err(axum::Error::new)?;
    socket.send(Message::Text(text.into())).await
}

async fn peer_connection(state: DaemonState, mut socket: WebSocket, meter: Arc<WireMeter>) {
    // Handshake: the first data frame must be auth.
    let parsed = loop {
        match socket.recv().await {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(msg)) => {
                if let Some(payload) = frame_payload(&msg) {
                    break serde_json::from_slice::<ClientFrame>(payload);
                }
            }
        }
    };

    let auth = match parsed {
        Ok(ClientFrame::Auth(auth)) => auth,
        Ok(_) => {
            tracing::warn!("first frame was not auth");
            let _ = send_frame(&mut socket, &ServerFrame::auth_error("expected authentication message")).await;
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse first frame");
            let _ = send_frame(&mut socket, &ServerFrame::auth_error("invalid authentication message")).await;
            return;
        }
    };

    if let Err(e) = state.auth.authenticate(&auth.identifier, &auth.token) {
        // The real failure kind stays in the log; the peer sees one
        // opaque failure so identifiers cannot be probed.
        tracing::warn!(identifier = %auth.identifier, error = %e, "authentication failed");
        let _ = send_frame(&mut socket, &ServerFrame::auth_error("authentication failed")).await;
        return;
    }

    let cancel = state.shutdown.child_token();
    let (session, outbound_rx) = Session::new(
        &auth.identifier,
        state.auth.name(&auth.identifier),
        &auth.version,
        auth.protocol_version,
        meter,
        cancel.clone(),
    );

    if let Err(e) = state.registry.add(session.clone()) {
        tracing::warn!(identifier = %auth.identifier, error = %e, "connection rejected");
        let _ = send_frame(&mut socket, &ServerFrame::auth_error("server at capacity")).await;
        return;
    }
    state.registry.mark_authenticated(&auth.identifier);

    // Persist the reported version so reconnection preserves it.
    state.states.set_version(&auth.identifier, &auth.version);

    if send_frame(&mut socket, &ServerFrame::auth_success()).await.is_err() {
        state.registry.remove(&session);
        return;
    }
    tracing::info!(
        identifier = %auth.identifier,
        version = %auth.version,
        protocol = auth.protocol_version,
        "peer authenticated"
    );

    let (sink, stream) = socket.split();
    state
        .tracker
        .spawn(writer(sink, outbound_rx, session.clone(), cancel.clone()));
    state.tracker.spawn(keeper(
        session.clone(),
        cancel.clone(),
        state.keepalive_interval,
        state.idle_timeout,
    ));

    reader(stream, &state, &session).await;

    session.terminate();
    state.registry.remove(&session);
}

/// Consume inbound frames until the transport fails, the peer closes,
/// or the session is cancelled.
async fn reader(mut stream: SplitStream<WebSocket>, state: &DaemonState, session: &Arc<Session>) {
    let mut limiter = (state.message_rate_limit > 0).then(|| {
        tokio::time::interval(Duration::from_secs_f64(
            1.0 / f64::from(state.message_rate_limit),
        ))
    });

    loop {
        let received = tokio::select! {
            _ = session.cancel_token().cancelled() => return,
            received = stream.next() => received,
        };

        let msg = match received {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                tracing::debug!(identifier = %session.identifier(), error = %e, "read error");
                return;
            }
            None => return,
        };
        if matches!(msg, Message::Close(_)) {
            return;
        }
        let Some(payload) = frame_payload(&msg) else {
            continue;
        };

        // Throttle processing after the read, before acting on the
        // frame, preserving TCP backpressure without dropping frames.
        if let Some(limiter) = limiter.as_mut() {
            limiter.tick().await;
        }

        session.add_bytes_received(payload.len() as u64);
        session.inc_messages_received();
        session.touch();

        match serde_json::from_slice::<ClientFrame>(payload) {
            Ok(frame) => dispatch(state, session, frame),
            Err(e) => {
                tracing::warn!(identifier = %session.identifier(), error = %e, "failed to parse frame");
            }
        }
    }
}

fn dispatch(state: &DaemonState, session: &Arc<Session>, frame: ClientFrame) {
    let identifier = session.identifier();
    match frame {
        ClientFrame::Keepalive(_) => {
            tracing::debug!(identifier = %identifier, "keepalive received");
        }
        ClientFrame::State(payload) => {
            session.inc_telemetry_received();
            state.states.update_full(identifier, payload.data);
            tracing::debug!(identifier = %identifier, "state snapshot received");
        }
        ClientFrame::Change(payload) => {
            session.inc_telemetry_received();
            state.states.update_delta(identifier, payload.changes);
            tracing::debug!(identifier = %identifier, "state changes received");
        }
        ClientFrame::Event(payload) => {
            session.inc_telemetry_received();
            let timestamp = parse_timestamp(&payload.timestamp);
            tracing::info!(identifier = %identifier, event = %payload.event, "event received");
            state
                .events
                .append(identifier, &payload.event, payload.data, timestamp);
        }
        ClientFrame::CommandResponse(payload) => {
            tracing::info!(
                identifier = %identifier,
                request_id = %payload.request_id,
                status = %payload.status,
                "command response received"
            );
            state.responses.store(identifier, "", payload);
        }
        ClientFrame::Auth(_) | ClientFrame::Unknown => {
            tracing::warn!(identifier = %identifier, "unexpected frame type, dropped");
        }
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Sole writer of the socket: pulls the outbound queue, serializes
/// frames, exits on write error or cancellation.
async fn writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerFrame>,
    session: Arc<Session>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(identifier = %session.identifier(), error = %e, "failed to serialize frame");
                continue;
            }
        };
        let len = text.len() as u64;

        if let Err(e) = sink.send(Message::Text(text.into())).await {
            tracing::debug!(identifier = %session.identifier(), error = %e, "write error");
            session.terminate();
            break;
        }
        session.add_bytes_sent(len);
        session.inc_messages_sent();
    }
}

/// On every keepalive tick: enforce the idle timeout, otherwise
/// enqueue a keepalive frame (dropped silently when the queue is full).
async fn keeper(
    session: Arc<Session>,
    cancel: CancellationToken,
    keepalive_interval: Duration,
    idle_timeout: Option<Duration>,
) {
    let mut ticker = tokio::time::interval(keepalive_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // consume the immediate tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Some(limit) = idle_timeout {
                    let idle = (Utc::now() - session.last_seen())
                        .to_std()
                        .unwrap_or_default();
                    if idle > limit {
                        tracing::info!(
                            identifier = %session.identifier(),
                            idle_secs = idle.as_secs(),
                            "idle timeout, closing connection"
                        );
                        session.terminate();
                        return;
                    }
                }

                if session.enqueue(ServerFrame::keepalive()) {
                    tracing::debug!(identifier = %session.identifier(), "keepalive sent");
                } else {
                    tracing::debug!(identifier = %session.identifier(), "outbound queue full, keepalive dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_fall_back_to_now() {
        let parsed = parse_timestamp("2025-06-01T10:00:00Z");
        assert_eq!(parsed.to_rfc3339(), "2025-06-01T10:00:00+00:00");

        let before = Utc::now();
        let fallback = parse_timestamp("not-a-timestamp");
        assert!(fallback >= before);
    }
}
