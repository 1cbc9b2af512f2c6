//! Response parking — command responses stored by request-id until an
//! operator polls for them, with TTL-based expiry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use uplink_core::protocol::CommandResponsePayload;

/// Default period between expiry sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Serialize)]
pub struct ResponseRecord {
    pub request_id: String,
    pub scooter_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command: String,
    pub response: CommandResponsePayload,
    pub received_at: DateTime<Utc>,
}

pub struct ResponseStore {
    responses: DashMap<String, ResponseRecord>,
    ttl: Duration,
}

impl ResponseStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            responses: DashMap::new(),
            ttl,
        }
    }

    /// Park a response. A second response with the same request-id
    /// overwrites the first.
    pub fn store(&self, scooter_id: &str, command: &str, response: CommandResponsePayload) {
        let record = ResponseRecord {
            request_id: response.request_id.clone(),
            scooter_id: scooter_id.to_string(),
            command: command.to_string(),
            response,
            received_at: Utc::now(),
        };
        self.responses.insert(record.request_id.clone(), record);
    }

    /// None means the response has not been delivered yet (pending).
    pub fn get(&self, request_id: &str) -> Option<ResponseRecord> {
        self.responses.get(request_id).map(|r| r.clone())
    }

    pub fn by_peer(&self, scooter_id: &str) -> Vec<ResponseRecord> {
        self.responses
            .iter()
            .filter(|r| r.scooter_id == scooter_id)
            .map(|r| r.clone())
            .collect()
    }

    /// Drop expired records. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero());
        let before = self.responses.len();
        self.responses.retain(|_, record| record.received_at > cutoff);
        before - self.responses.len()
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    /// Background expiry sweep until cancelled.
    pub async fn sweep_loop(
        self: std::sync::Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let removed = self.sweep();
                    if removed > 0 {
                        tracing::debug!(removed, "swept expired command responses");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(request_id: &str, status: &str) -> CommandResponsePayload {
        CommandResponsePayload {
            request_id: request_id.to_string(),
            status: status.to_string(),
            result: None,
            error: String::new(),
            timestamp: String::new(),
        }
    }

    #[test]
    fn store_and_get() {
        let store = ResponseStore::new(Duration::from_secs(3600));
        assert!(store.get("req-1").is_none());

        store.store("s1", "", response("req-1", "success"));
        let record = store.get("req-1").unwrap();
        assert_eq!(record.scooter_id, "s1");
        assert_eq!(record.response.status, "success");
    }

    #[test]
    fn same_request_id_overwrites() {
        let store = ResponseStore::new(Duration::from_secs(3600));
        store.store("s1", "", response("req-1", "running"));
        store.store("s1", "", response("req-1", "success"));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("req-1").unwrap().response.status, "success");
    }

    #[test]
    fn by_peer_filters() {
        let store = ResponseStore::new(Duration::from_secs(3600));
        store.store("s1", "", response("req-1", "success"));
        store.store("s1", "", response("req-2", "error"));
        store.store("s2", "", response("req-3", "success"));

        assert_eq!(store.by_peer("s1").len(), 2);
        assert_eq!(store.by_peer("s2").len(), 1);
        assert!(store.by_peer("ghost").is_empty());
    }

    #[test]
    fn sweep_drops_only_expired() {
        let store = ResponseStore::new(Duration::ZERO);
        store.store("s1", "", response("req-1", "success"));
        // TTL of zero expires everything immediately.
        assert_eq!(store.sweep(), 1);
        assert!(store.get("req-1").is_none());

        let store = ResponseStore::new(Duration::from_secs(3600));
        store.store("s1", "", response("req-2", "success"));
        assert_eq!(store.sweep(), 0);
        assert!(store.get("req-2").is_some());
    }
}
