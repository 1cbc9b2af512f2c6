//! Connection registry — index of live peer sessions.
//!
//! Publishes presence transitions to subscribers and accumulates
//! lifetime counters for peers that have since disconnected. A
//! reconnecting identifier replaces its previous session: the old
//! session's counters are rolled up and its token cancelled before the
//! new one binds, and removal is pointer-matched so the old session's
//! teardown cannot evict its replacement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::session::Session;

/// Bound on queued presence events per subscriber; slow subscribers
/// lose events rather than block the ingest path.
const PRESENCE_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("connection limit reached ({0})")]
    AtCapacity(usize),
}

/// Peer lifecycle transition delivered to subscribers.
#[derive(Clone)]
pub enum Presence {
    Online(Arc<Session>),
    Offline(String),
}

#[derive(Debug, Default, Clone, Copy)]
struct LifetimeTotals {
    connections: u64,
    authenticated: u64,
    bytes_sent: u64,
    bytes_received: u64,
    telemetry: u64,
    commands: u64,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Arc<Session>>,
    subscribers: HashMap<u64, mpsc::Sender<Presence>>,
    lifetime: LifetimeTotals,
}

/// Aggregates over live sessions combined with lifetime totals from
/// departed peers.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active_connections: usize,
    pub authenticated: usize,
    pub total_connections: u64,
    pub total_authenticated: u64,
    pub session_bytes_sent: u64,
    pub session_bytes_received: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub session_telemetry: u64,
    pub total_telemetry: u64,
    pub session_commands: u64,
    pub total_commands: u64,
}

pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    next_sub_id: AtomicU64,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// `max_connections` of 0 means unlimited.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_sub_id: AtomicU64::new(0),
            max_connections,
        }
    }

    /// Register a session, replacing any prior session with the same
    /// identifier. Fails only when the registry is at capacity and the
    /// identifier is not already present.
    pub fn add(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let id = session.identifier().to_string();
        let replaced = {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            let replaced = inner.sessions.remove(&id);
            match replaced {
                Some(ref old) => roll_up(&mut inner.lifetime, old),
                None => {
                    if self.max_connections > 0 && inner.sessions.len() >= self.max_connections {
                        return Err(RegistryError::AtCapacity(self.max_connections));
                    }
                }
            }
            inner.sessions.insert(id.clone(), session.clone());
            inner.lifetime.connections += 1;
            replaced
        };

        if let Some(old) = replaced {
            old.terminate();
            tracing::info!(identifier = %id, "replaced prior session on reconnect");
            self.broadcast(Presence::Offline(id.clone()));
        }
        tracing::info!(identifier = %id, active = self.len(), "peer registered");
        self.broadcast(Presence::Online(session));
        Ok(())
    }

    /// Remove a session at teardown. A no-op when the stored entry is
    /// not this exact session (it was already replaced by a reconnect).
    pub fn remove(&self, session: &Arc<Session>) {
        let id = session.identifier();
        {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            let is_current = inner
                .sessions
                .get(id)
                .is_some_and(|stored| Arc::ptr_eq(stored, session));
            if !is_current {
                return;
            }
            inner.sessions.remove(id);
            roll_up(&mut inner.lifetime, session);
        }

        tracing::info!(identifier = %id, active = self.len(), "peer removed");
        self.broadcast(Presence::Offline(id.to_string()));
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<Session>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .sessions
            .get(identifier)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .sessions
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .sessions
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flag a registered session as authenticated.
    pub fn mark_authenticated(&self, identifier: &str) -> bool {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let Some(session) = inner.sessions.get(identifier).cloned() else {
            return false;
        };
        session.set_authenticated();
        inner.lifetime.authenticated += 1;
        true
    }

    /// Subscribe to presence events. Returns the receiver and the id
    /// used to unsubscribe.
    pub fn subscribe(&self) -> (mpsc::Receiver<Presence>, u64) {
        let (tx, rx) = mpsc::channel(PRESENCE_QUEUE_CAPACITY);
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .write()
            .expect("registry lock poisoned")
            .subscribers
            .insert(id, tx);
        (rx, id)
    }

    /// Drops the subscriber's sender, closing its channel.
    pub fn unsubscribe(&self, id: u64) {
        self.inner
            .write()
            .expect("registry lock poisoned")
            .subscribers
            .remove(&id);
    }

    fn broadcast(&self, event: Presence) {
        let inner = self.inner.read().expect("registry lock poisoned");
        for tx in inner.subscribers.values() {
            // Slow subscribers lose events.
            let _ = tx.try_send(event.clone());
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().expect("registry lock poisoned");

        let mut authenticated = 0;
        let mut session_bytes_sent = 0;
        let mut session_bytes_received = 0;
        let mut session_telemetry = 0;
        let mut session_commands = 0;
        for session in inner.sessions.values() {
            if session.is_authenticated() {
                authenticated += 1;
            }
            session_bytes_sent += session.bytes_sent();
            session_bytes_received += session.bytes_received();
            session_telemetry += session.telemetry_received();
            session_commands += session.commands_sent();
        }

        let lifetime = inner.lifetime;
        RegistryStats {
            active_connections: inner.sessions.len(),
            authenticated,
            total_connections: lifetime.connections,
            total_authenticated: lifetime.authenticated,
            session_bytes_sent,
            session_bytes_received,
            total_bytes_sent: lifetime.bytes_sent + session_bytes_sent,
            total_bytes_received: lifetime.bytes_received + session_bytes_received,
            session_telemetry,
            total_telemetry: lifetime.telemetry + session_telemetry,
            session_commands,
            total_commands: lifetime.commands + session_commands,
        }
    }

    /// Periodic stats log line until cancelled.
    pub async fn aggregate_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let s = self.stats();
                    tracing::info!(
                        active = s.active_connections,
                        authenticated = s.authenticated,
                        session_up_kb = s.session_bytes_sent / 1024,
                        session_down_kb = s.session_bytes_received / 1024,
                        session_telemetry = s.session_telemetry,
                        session_commands = s.session_commands,
                        total_up_kb = s.total_bytes_sent / 1024,
                        total_down_kb = s.total_bytes_received / 1024,
                        total_telemetry = s.total_telemetry,
                        total_commands = s.total_commands,
                        "connection stats"
                    );
                }
            }
        }
    }
}

fn roll_up(lifetime: &mut LifetimeTotals, session: &Session) {
    lifetime.bytes_sent += session.bytes_sent();
    lifetime.bytes_received += session.bytes_received();
    lifetime.telemetry += session.telemetry_received();
    lifetime.commands += session.commands_sent();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::WireMeter;
    use uplink_core::protocol::ServerFrame;

    fn session(id: &str) -> (Arc<Session>, mpsc::Receiver<ServerFrame>) {
        Session::new(
            id,
            "",
            "1.0.0",
            1,
            Arc::new(WireMeter::default()),
            CancellationToken::new(),
        )
    }

    #[test]
    fn add_get_remove() {
        let registry = ConnectionRegistry::new(0);
        let (s1, _rx) = session("s1");

        registry.add(s1.clone()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("s1").is_some());

        registry.remove(&s1);
        assert!(registry.get("s1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn capacity_limit_rejects_new_identifiers() {
        let registry = ConnectionRegistry::new(1);
        let (s1, _rx1) = session("s1");
        let (s2, _rx2) = session("s2");

        registry.add(s1).unwrap();
        assert!(matches!(
            registry.add(s2),
            Err(RegistryError::AtCapacity(1))
        ));
    }

    #[test]
    fn reconnect_bypasses_capacity_limit() {
        let registry = ConnectionRegistry::new(1);
        let (s1a, _rx1) = session("s1");
        let (s1b, _rx2) = session("s1");

        registry.add(s1a).unwrap();
        registry.add(s1b).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn replace_terminates_prior_session() {
        let registry = ConnectionRegistry::new(0);
        let (old, _rx1) = session("s1");
        let (new, _rx2) = session("s1");

        registry.add(old.clone()).unwrap();
        old.add_bytes_sent(100);
        registry.add(new.clone()).unwrap();

        assert!(old.cancel_token().is_cancelled());
        assert!(!new.cancel_token().is_cancelled());
        assert!(Arc::ptr_eq(&registry.get("s1").unwrap(), &new));

        // The replaced session's counters moved into the lifetime totals.
        let stats = registry.stats();
        assert_eq!(stats.total_bytes_sent, 100);
        assert_eq!(stats.session_bytes_sent, 0);
    }

    #[test]
    fn stale_remove_does_not_evict_replacement() {
        let registry = ConnectionRegistry::new(0);
        let (old, _rx1) = session("s1");
        let (new, _rx2) = session("s1");

        registry.add(old.clone()).unwrap();
        registry.add(new.clone()).unwrap();

        // The old session's teardown races the reconnect; it must not
        // remove the replacement, nor double-count its counters.
        registry.remove(&old);
        assert!(registry.get("s1").is_some());
        assert_eq!(registry.stats().total_connections, 2);
    }

    #[test]
    fn mark_authenticated_sets_flag_and_counts() {
        let registry = ConnectionRegistry::new(0);
        let (s1, _rx) = session("s1");
        registry.add(s1.clone()).unwrap();

        assert!(!s1.is_authenticated());
        assert!(registry.mark_authenticated("s1"));
        assert!(s1.is_authenticated());
        assert!(!registry.mark_authenticated("ghost"));

        let stats = registry.stats();
        assert_eq!(stats.authenticated, 1);
        assert_eq!(stats.total_authenticated, 1);
    }

    #[test]
    fn stats_combine_live_and_lifetime() {
        let registry = ConnectionRegistry::new(0);
        let (s1, _rx1) = session("s1");
        registry.add(s1.clone()).unwrap();
        s1.add_bytes_sent(10);
        s1.inc_telemetry_received();
        registry.remove(&s1);

        let (s2, _rx2) = session("s2");
        registry.add(s2.clone()).unwrap();
        s2.add_bytes_sent(5);

        let stats = registry.stats();
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.session_bytes_sent, 5);
        assert_eq!(stats.total_bytes_sent, 15);
        assert_eq!(stats.total_telemetry, 1);
    }

    #[tokio::test]
    async fn presence_online_precedes_offline() {
        let registry = ConnectionRegistry::new(0);
        let (mut rx, sub_id) = registry.subscribe();

        let (s1, _qrx) = session("s1");
        registry.add(s1.clone()).unwrap();
        registry.remove(&s1);

        match rx.recv().await.unwrap() {
            Presence::Online(s) => assert_eq!(s.identifier(), "s1"),
            Presence::Offline(_) => panic!("offline before online"),
        }
        match rx.recv().await.unwrap() {
            Presence::Offline(id) => assert_eq!(id, "s1"),
            Presence::Online(_) => panic!("expected offline"),
        }

        registry.unsubscribe(sub_id);
    }

    #[tokio::test]
    async fn unsubscribe_closes_channel() {
        let registry = ConnectionRegistry::new(0);
        let (mut rx, sub_id) = registry.subscribe();
        registry.unsubscribe(sub_id);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_loses_events() {
        let registry = ConnectionRegistry::new(0);
        let (mut rx, _sub_id) = registry.subscribe();

        // Overflow the presence queue; sends must not block.
        let mut keep = Vec::new();
        for i in 0..PRESENCE_QUEUE_CAPACITY + 5 {
            let (s, qrx) = session(&format!("s{i}"));
            keep.push(qrx);
            registry.add(s).unwrap();
        }

        let mut received = 0;
        while let Ok(_event) = rx.try_recv() {
            received += 1;
        }
        assert_eq!(received, PRESENCE_QUEUE_CAPACITY);
    }
}
