//! REST surface tests — drive the router directly with tower.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use uplink_api::{router, ApiState};
use uplink_core::protocol::{CommandResponsePayload, ServerFrame};
use uplink_store::{
    CommandRouter, ConnectionRegistry, EventStore, ResponseStore, Session, StateStore, WireMeter,
    OUTBOUND_QUEUE_CAPACITY,
};

const API_KEY: &str = "test-key";

struct Fixture {
    state: ApiState,
    responses: Arc<ResponseStore>,
}

fn fixture() -> Fixture {
    let registry = Arc::new(ConnectionRegistry::new(0));
    let responses = Arc::new(ResponseStore::new(Duration::from_secs(3600)));
    let state = ApiState {
        registry: registry.clone(),
        commands: CommandRouter::new(registry, responses.clone()),
        states: Arc::new(StateStore::in_memory()),
        events: Arc::new(EventStore::in_memory(1000)),
        api_key: API_KEY.to_string(),
    };
    Fixture { state, responses }
}

/// Register a connected, authenticated session. The returned receiver
/// must stay alive to keep the outbound queue open.
fn connect(state: &ApiState, id: &str) -> (Arc<Session>, mpsc::Receiver<ServerFrame>) {
    let (session, rx) = Session::new(
        id,
        "",
        "1.0.0",
        1,
        Arc::new(WireMeter::default()),
        CancellationToken::new(),
    );
    state.registry.add(session.clone()).unwrap();
    state.registry.mark_authenticated(id);
    (session, rx)
}

async fn request(
    state: &ApiState,
    method: &str,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("x-api-key", API_KEY);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = router(state.clone())
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn missing_api_key_is_unauthorized() {
    let fx = fixture();
    let response = router(fx.state.clone())
        .oneshot(
            Request::builder()
                .uri("/scooters")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_api_key_is_unauthorized() {
    let fx = fixture();
    let response = router(fx.state.clone())
        .oneshot(
            Request::builder()
                .uri("/scooters")
                .header("x-api-key", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn list_scooters_includes_counters() {
    let fx = fixture();
    let (session, _rx) = connect(&fx.state, "s1");
    session.add_bytes_received(42);

    let (status, body) = request(&fx.state, "GET", "/scooters", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["scooters"][0]["identifier"], "s1");
    assert_eq!(body["scooters"][0]["bytes_received"], 42);
    assert_eq!(body["scooters"][0]["authenticated"], true);
}

#[tokio::test]
async fn detail_of_unknown_scooter_is_404() {
    let fx = fixture();
    let (status, body) = request(&fx.state, "GET", "/scooters/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "scooter not connected");
}

#[tokio::test]
async fn state_is_empty_until_reported() {
    let fx = fixture();
    let (_session, _rx) = connect(&fx.state, "s1");

    let (status, body) = request(&fx.state, "GET", "/scooters/s1/state", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], json!({}));

    fx.state.states.update_full(
        "s1",
        json!({"battery:0": {"charge": "64"}})
            .as_object()
            .unwrap()
            .clone(),
    );

    let (status, body) = request(&fx.state, "GET", "/scooters/s1/state", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"]["battery:0"]["charge"], "64");
}

#[tokio::test]
async fn events_listing_and_deletion() {
    let fx = fixture();
    let (_session, _rx) = connect(&fx.state, "s1");
    let old = fx.state.events.append("s1", "unlock", None, Utc::now());
    fx.state.events.append(
        "s1",
        "lock",
        None,
        Utc::now() + chrono::Duration::seconds(1),
    );

    let (status, body) = request(&fx.state, "GET", "/scooters/s1/events", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["events"][0]["event"], "lock");

    let (status, _body) = request(
        &fx.state,
        "DELETE",
        &format!("/scooters/s1/events/{}", old.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = request(
        &fx.state,
        "DELETE",
        &format!("/scooters/s1/events/{}", old.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "event not found");

    let (status, _body) = request(&fx.state, "DELETE", "/scooters/s1/events", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_status, body) = request(&fx.state, "GET", "/scooters/s1/events", None).await;
    assert_eq!(body["total"], 0);
}

#[tokio::test]
async fn send_command_to_unknown_scooter_is_404() {
    let fx = fixture();
    let (status, body) = request(
        &fx.state,
        "POST",
        "/commands",
        Some(json!({"scooter_id": "NONE", "command": "lock"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "scooter not connected");
}

#[tokio::test]
async fn send_command_requires_fields() {
    let fx = fixture();
    let (status, _body) = request(
        &fx.state,
        "POST",
        "/commands",
        Some(json!({"scooter_id": "s1"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn send_command_round_trip() {
    let fx = fixture();
    let (_session, mut rx) = connect(&fx.state, "s1");

    let (status, body) = request(
        &fx.state,
        "POST",
        "/commands",
        Some(json!({"scooter_id": "s1", "command": "lock", "params": {"force": true}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "sent");
    let request_id = body["request_id"].as_str().unwrap().to_string();

    // The command frame landed on the session's outbound queue.
    let ServerFrame::Command(cmd) = rx.try_recv().unwrap() else {
        panic!("expected command frame");
    };
    assert_eq!(cmd.request_id, request_id);

    // Pending until the peer responds.
    let (status, body) = request(
        &fx.state,
        "GET",
        &format!("/commands/{request_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");

    fx.responses.store(
        "s1",
        "",
        CommandResponsePayload {
            request_id: request_id.clone(),
            status: "success".to_string(),
            result: Some(json!({"message": "done"}).as_object().unwrap().clone()),
            error: String::new(),
            timestamp: String::new(),
        },
    );

    let (status, body) = request(
        &fx.state,
        "GET",
        &format!("/commands/{request_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["result"]["message"], "done");

    let (status, body) = request(&fx.state, "GET", "/scooters/s1/commands", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
}

#[tokio::test]
async fn full_outbound_queue_is_503() {
    let fx = fixture();
    let (session, _rx) = connect(&fx.state, "s1");
    for _ in 0..OUTBOUND_QUEUE_CAPACITY {
        assert!(session.enqueue(ServerFrame::keepalive()));
    }

    let (status, body) = request(
        &fx.state,
        "POST",
        "/commands",
        Some(json!({"scooter_id": "s1", "command": "lock"})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "outbound queue full, try again later");
}
