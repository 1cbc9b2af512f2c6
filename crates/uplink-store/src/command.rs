//! Command router — outbound command dispatch and result lookup.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};

use uplink_core::protocol::{self, CommandPayload, ServerFrame};

use crate::registry::ConnectionRegistry;
use crate::response_store::{ResponseRecord, ResponseStore};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("peer not connected: {0}")]
    NotConnected(String),
    #[error("peer not authenticated: {0}")]
    NotAuthenticated(String),
    #[error("outbound queue full for peer: {0}")]
    Backpressure(String),
}

#[derive(Clone)]
pub struct CommandRouter {
    registry: Arc<ConnectionRegistry>,
    responses: Arc<ResponseStore>,
}

/// Request-id minted from the current time with microsecond precision.
fn new_request_id() -> String {
    Utc::now().format("%Y%m%d-%H%M%S%.6f").to_string()
}

impl CommandRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, responses: Arc<ResponseStore>) -> Self {
        Self {
            registry,
            responses,
        }
    }

    /// Enqueue a command frame on the peer's outbound queue and return
    /// the minted request-id. Fails fast on a full queue; the caller
    /// decides whether to retry or surface 503.
    pub fn send(
        &self,
        scooter_id: &str,
        command: &str,
        params: Map<String, Value>,
    ) -> Result<String, CommandError> {
        let session = self
            .registry
            .get(scooter_id)
            .ok_or_else(|| CommandError::NotConnected(scooter_id.to_string()))?;
        if !session.is_authenticated() {
            return Err(CommandError::NotAuthenticated(scooter_id.to_string()));
        }

        let request_id = new_request_id();
        let frame = ServerFrame::Command(CommandPayload {
            request_id: request_id.clone(),
            command: command.to_string(),
            params,
            timestamp: protocol::timestamp(),
        });

        if !session.enqueue(frame) {
            return Err(CommandError::Backpressure(scooter_id.to_string()));
        }
        session.inc_commands_sent();
        tracing::info!(identifier = %scooter_id, command, request_id = %request_id, "command sent");
        Ok(request_id)
    }

    /// Parked response for a request-id, or None while pending. Never
    /// blocks.
    pub fn result(&self, request_id: &str) -> Option<ResponseRecord> {
        self.responses.get(request_id)
    }

    pub fn results_for(&self, scooter_id: &str) -> Vec<ResponseRecord> {
        self.responses.by_peer(scooter_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::WireMeter;
    use crate::session::{Session, OUTBOUND_QUEUE_CAPACITY};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uplink_core::protocol::CommandResponsePayload;

    fn router_with_session(
        id: &str,
        authenticated: bool,
    ) -> (
        CommandRouter,
        Arc<Session>,
        tokio::sync::mpsc::Receiver<ServerFrame>,
    ) {
        let registry = Arc::new(ConnectionRegistry::new(0));
        let responses = Arc::new(ResponseStore::new(Duration::from_secs(3600)));
        let (session, rx) = Session::new(
            id,
            "",
            "1.0.0",
            1,
            Arc::new(WireMeter::default()),
            CancellationToken::new(),
        );
        registry.add(session.clone()).unwrap();
        if authenticated {
            registry.mark_authenticated(id);
        }
        (CommandRouter::new(registry, responses), session, rx)
    }

    #[test]
    fn send_enqueues_command_frame() {
        let (router, session, mut rx) = router_with_session("s1", true);

        let request_id = router.send("s1", "lock", Map::new()).unwrap();
        assert_eq!(session.commands_sent(), 1);

        let frame = rx.try_recv().unwrap();
        let ServerFrame::Command(cmd) = frame else {
            panic!("expected command frame");
        };
        assert_eq!(cmd.request_id, request_id);
        assert_eq!(cmd.command, "lock");
    }

    #[test]
    fn send_to_unknown_peer_fails() {
        let (router, _session, _rx) = router_with_session("s1", true);
        assert!(matches!(
            router.send("ghost", "lock", Map::new()),
            Err(CommandError::NotConnected(_))
        ));
    }

    #[test]
    fn send_to_unauthenticated_peer_fails() {
        let (router, session, _rx) = router_with_session("s1", false);
        let result = router.send("s1", "lock", Map::new());
        assert!(matches!(result, Err(CommandError::NotAuthenticated(_))));
        assert_eq!(session.commands_sent(), 0);
    }

    #[test]
    fn full_queue_is_backpressure_and_does_not_count() {
        let (router, session, _rx) = router_with_session("s1", true);
        for _ in 0..OUTBOUND_QUEUE_CAPACITY {
            assert!(session.enqueue(ServerFrame::keepalive()));
        }

        let result = router.send("s1", "lock", Map::new());
        assert!(matches!(result, Err(CommandError::Backpressure(_))));
        assert_eq!(session.commands_sent(), 0);
    }

    #[test]
    fn request_ids_have_microsecond_format() {
        let id = new_request_id();
        // YYYYMMDD-hhmmss.uuuuuu
        assert_eq!(id.len(), 22);
        assert_eq!(&id[8..9], "-");
        assert_eq!(&id[15..16], ".");
    }

    #[test]
    fn result_transitions_from_pending_to_parked() {
        let (router, _session, _rx) = router_with_session("s1", true);
        let request_id = router.send("s1", "lock", Map::new()).unwrap();

        assert!(router.result(&request_id).is_none());

        router.responses.store(
            "s1",
            "",
            CommandResponsePayload {
                request_id: request_id.clone(),
                status: "success".to_string(),
                result: None,
                error: String::new(),
                timestamp: String::new(),
            },
        );

        let record = router.result(&request_id).unwrap();
        assert_eq!(record.response.status, "success");
        assert_eq!(router.results_for("s1").len(), 1);
    }
}
