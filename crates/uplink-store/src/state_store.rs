//! State store — authoritative latest-reported state per peer.
//!
//! A `state` frame replaces the whole nested map; a `change` frame
//! deep-merges one level (section maps combine field-wise, anything
//! else replaces). Every mutation writes a JSON snapshot of the whole
//! store atomically via temp-file + rename; persistence failures are
//! logged and never fail the in-memory mutation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// Bound on queued updates per subscriber.
const STATE_QUEUE_CAPACITY: usize = 100;

/// Stored record for one peer. Field names match the on-disk snapshot
/// format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerState {
    #[serde(rename = "ScooterID")]
    pub scooter_id: String,
    #[serde(rename = "State")]
    pub state: Map<String, Value>,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "LastUpdated")]
    pub last_updated: DateTime<Utc>,
    #[serde(rename = "LastChangeAt")]
    pub last_change_at: DateTime<Utc>,
}

impl PeerState {
    fn empty(scooter_id: &str) -> Self {
        let now = Utc::now();
        Self {
            scooter_id: scooter_id.to_string(),
            state: Map::new(),
            version: String::new(),
            last_updated: now,
            last_change_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Full,
    Delta,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::Full => "full",
            UpdateKind::Delta => "delta",
        }
    }
}

/// Change notification delivered to subscribers. For a delta update
/// `state` carries only the changed sections.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub scooter_id: String,
    pub state: Map<String, Value>,
    pub kind: UpdateKind,
    pub timestamp: DateTime<Utc>,
}

struct Inner {
    states: HashMap<String, PeerState>,
    subscribers: HashMap<u64, mpsc::Sender<StateUpdate>>,
}

pub struct StateStore {
    inner: RwLock<Inner>,
    next_sub_id: AtomicU64,
    path: Option<PathBuf>,
}

impl StateStore {
    /// Load any existing snapshot from `path` and write through to it
    /// on every mutation.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let states = load_snapshot(&path);
        Self {
            inner: RwLock::new(Inner {
                states,
                subscribers: HashMap::new(),
            }),
            next_sub_id: AtomicU64::new(0),
            path: Some(path),
        }
    }

    /// No persistence; used by tests and ephemeral deployments.
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Inner {
                states: HashMap::new(),
                subscribers: HashMap::new(),
            }),
            next_sub_id: AtomicU64::new(0),
            path: None,
        }
    }

    /// Replace the peer's state wholesale.
    pub fn update_full(&self, scooter_id: &str, data: Map<String, Value>) {
        let now = Utc::now();
        {
            let mut inner = self.inner.write().expect("state lock poisoned");
            let entry = inner
                .states
                .entry(scooter_id.to_string())
                .or_insert_with(|| PeerState::empty(scooter_id));
            entry.state = data.clone();
            entry.last_updated = now;
            entry.last_change_at = now;
        }

        self.save();
        self.broadcast(StateUpdate {
            scooter_id: scooter_id.to_string(),
            state: data,
            kind: UpdateKind::Full,
            timestamp: now,
        });
    }

    /// Merge changed sections into the peer's state, one level deep:
    /// when both sides of a section key are objects their fields
    /// combine with the delta winning; otherwise the delta value
    /// replaces the section.
    pub fn update_delta(&self, scooter_id: &str, changes: Map<String, Value>) {
        let now = Utc::now();
        {
            let mut inner = self.inner.write().expect("state lock poisoned");
            let entry = inner
                .states
                .entry(scooter_id.to_string())
                .or_insert_with(|| PeerState::empty(scooter_id));

            for (key, value) in changes.clone() {
                match value {
                    Value::Object(incoming) => {
                        if let Some(Value::Object(existing)) = entry.state.get_mut(&key) {
                            for (field, field_value) in incoming {
                                existing.insert(field, field_value);
                            }
                        } else {
                            entry.state.insert(key, Value::Object(incoming));
                        }
                    }
                    other => {
                        entry.state.insert(key, other);
                    }
                }
            }

            entry.last_updated = now;
            entry.last_change_at = now;
        }

        self.save();
        self.broadcast(StateUpdate {
            scooter_id: scooter_id.to_string(),
            state: changes,
            kind: UpdateKind::Delta,
            timestamp: now,
        });
    }

    /// Clone of the peer's record; callers cannot mutate store state.
    pub fn get(&self, scooter_id: &str) -> Option<PeerState> {
        self.inner
            .read()
            .expect("state lock poisoned")
            .states
            .get(scooter_id)
            .cloned()
    }

    pub fn all(&self) -> HashMap<String, PeerState> {
        self.inner
            .read()
            .expect("state lock poisoned")
            .states
            .clone()
    }

    /// Record the version a peer reported at handshake so it survives
    /// disconnection.
    pub fn set_version(&self, scooter_id: &str, version: &str) {
        {
            let mut inner = self.inner.write().expect("state lock poisoned");
            let entry = inner
                .states
                .entry(scooter_id.to_string())
                .or_insert_with(|| PeerState::empty(scooter_id));
            entry.version = version.to_string();
            entry.last_updated = Utc::now();
        }
        self.save();
    }

    pub fn remove(&self, scooter_id: &str) {
        self.inner
            .write()
            .expect("state lock poisoned")
            .states
            .remove(scooter_id);
        self.save();
    }

    pub fn subscribe(&self) -> (mpsc::Receiver<StateUpdate>, u64) {
        let (tx, rx) = mpsc::channel(STATE_QUEUE_CAPACITY);
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .write()
            .expect("state lock poisoned")
            .subscribers
            .insert(id, tx);
        (rx, id)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner
            .write()
            .expect("state lock poisoned")
            .subscribers
            .remove(&id);
    }

    fn broadcast(&self, update: StateUpdate) {
        let inner = self.inner.read().expect("state lock poisoned");
        for tx in inner.subscribers.values() {
            // Slow subscribers lose updates.
            let _ = tx.try_send(update.clone());
        }
    }

    /// Snapshot the whole store to disk. O(total state size); fine at
    /// fleet scale, a log-structured layout is the refactor path
    /// beyond that.
    fn save(&self) {
        let Some(path) = &self.path else { return };

        let data = {
            let inner = self.inner.read().expect("state lock poisoned");
            match serde_json::to_vec_pretty(&inner.states) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize state snapshot");
                    return;
                }
            }
        };

        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let tmp = path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp, data) {
            tracing::warn!(error = %e, path = %tmp.display(), "failed to write state snapshot");
            return;
        }
        if let Err(e) = std::fs::rename(&tmp, path) {
            tracing::warn!(error = %e, path = %path.display(), "failed to replace state snapshot");
        }
    }
}

fn load_snapshot(path: &PathBuf) -> HashMap<String, PeerState> {
    if !path.exists() {
        return HashMap::new();
    }

    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "failed to read state snapshot");
            return HashMap::new();
        }
    };

    match serde_json::from_slice::<HashMap<String, PeerState>>(&data) {
        Ok(states) => {
            tracing::info!(peers = states.len(), path = %path.display(), "loaded state snapshot");
            states
        }
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "failed to parse state snapshot");
            HashMap::new()
        }
    }
}
