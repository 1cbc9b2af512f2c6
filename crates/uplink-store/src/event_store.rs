//! Event log — bounded per-peer ring of named events.
//!
//! In memory events are kept newest-first and capped per peer. On disk
//! the log is append-only JSON lines, oldest-first; loading reverses
//! and trims. Append writes one line; delete and clear rewrite the
//! whole file atomically via temp-file + rename.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// Bound on queued events per subscriber.
const EVENT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub scooter_id: String,
    pub event: String,
    pub data: Option<Map<String, Value>>,
    pub timestamp: DateTime<Utc>,
}

/// Deterministic event id: compact UTC seconds plus a nine-digit
/// subsecond tail. Best-effort unique within a peer; two events in the
/// same nanosecond collide.
fn event_id(timestamp: DateTime<Utc>) -> String {
    format!(
        "{}-{:09}",
        timestamp.format("%Y%m%d%H%M%S"),
        timestamp.nanosecond()
    )
}

struct Inner {
    events: HashMap<String, Vec<EventRecord>>,
    subscribers: HashMap<u64, mpsc::Sender<EventRecord>>,
}

pub struct EventStore {
    inner: RwLock<Inner>,
    next_sub_id: AtomicU64,
    max_per_peer: usize,
    path: Option<PathBuf>,
}

impl EventStore {
    pub fn new(max_per_peer: usize, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let events = load_log(&path, max_per_peer);
        Self {
            inner: RwLock::new(Inner {
                events,
                subscribers: HashMap::new(),
            }),
            next_sub_id: AtomicU64::new(0),
            max_per_peer,
            path: Some(path),
        }
    }

    pub fn in_memory(max_per_peer: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                events: HashMap::new(),
                subscribers: HashMap::new(),
            }),
            next_sub_id: AtomicU64::new(0),
            max_per_peer,
            path: None,
        }
    }

    /// Append an event for a peer, trimming the oldest past the cap.
    pub fn append(
        &self,
        scooter_id: &str,
        event: &str,
        data: Option<Map<String, Value>>,
        timestamp: DateTime<Utc>,
    ) -> EventRecord {
        let record = EventRecord {
            id: event_id(timestamp),
            scooter_id: scooter_id.to_string(),
            event: event.to_string(),
            data,
            timestamp,
        };

        {
            let mut inner = self.inner.write().expect("event lock poisoned");
            let events = inner.events.entry(scooter_id.to_string()).or_default();
            events.insert(0, record.clone());
            events.truncate(self.max_per_peer);
        }

        self.append_line(&record);
        self.broadcast(record.clone());
        record
    }

    /// Newest-first events for a peer. `limit` of 0 means all.
    pub fn list(&self, scooter_id: &str, limit: usize) -> Vec<EventRecord> {
        let inner = self.inner.read().expect("event lock poisoned");
        let Some(events) = inner.events.get(scooter_id) else {
            return Vec::new();
        };
        if limit > 0 && limit < events.len() {
            events[..limit].to_vec()
        } else {
            events.clone()
        }
    }

    pub fn all(&self) -> HashMap<String, Vec<EventRecord>> {
        self.inner
            .read()
            .expect("event lock poisoned")
            .events
            .clone()
    }

    /// Delete one event by id. Rewrites the log file; no broadcast.
    pub fn delete(&self, scooter_id: &str, event_id: &str) -> bool {
        let deleted = {
            let mut inner = self.inner.write().expect("event lock poisoned");
            let Some(events) = inner.events.get_mut(scooter_id) else {
                return false;
            };
            let before = events.len();
            events.retain(|e| e.id != event_id);
            events.len() != before
        };

        if deleted {
            self.rewrite();
        }
        deleted
    }

    /// Drop all of a peer's events. Rewrites the log file; no broadcast.
    pub fn clear(&self, scooter_id: &str) {
        self.inner
            .write()
            .expect("event lock poisoned")
            .events
            .remove(scooter_id);
        self.rewrite();
    }

    pub fn subscribe(&self) -> (mpsc::Receiver<EventRecord>, u64) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .write()
            .expect("event lock poisoned")
            .subscribers
            .insert(id, tx);
        (rx, id)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner
            .write()
            .expect("event lock poisoned")
            .subscribers
            .remove(&id);
    }

    fn broadcast(&self, event: EventRecord) {
        let inner = self.inner.read().expect("event lock poisoned");
        for tx in inner.subscribers.values() {
            // Slow subscribers lose events.
            let _ = tx.try_send(event.clone());
        }
    }

    fn append_line(&self, record: &EventRecord) {
        let Some(path) = &self.path else { return };

        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let line = match serde_json::to_vec(record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize event");
                return;
            }
        };

        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| {
                file.write_all(&line)?;
                file.write_all(b"\n")
            });
        if let Err(e) = result {
            tracing::warn!(error = %e, path = %path.display(), "failed to append event");
        }
    }

    /// Rewrite the whole log from memory, oldest-first per peer.
    fn rewrite(&self) {
        let Some(path) = &self.path else { return };

        let snapshot = {
            let inner = self.inner.read().expect("event lock poisoned");
            inner.events.clone()
        };

        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let mut buf = Vec::new();
        for events in snapshot.values() {
            for record in events.iter().rev() {
                match serde_json::to_vec(record) {
                    Ok(line) => {
                        buf.extend_from_slice(&line);
                        buf.push(b'\n');
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
                }
            }
        }

        let tmp = path.with_extension("jsonl.tmp");
        if let Err(e) = std::fs::write(&tmp, buf) {
            tracing::warn!(error = %e, path = %tmp.display(), "failed to write event log");
            return;
        }
        if let Err(e) = std::fs::rename(&tmp, path) {
            tracing::warn!(error = %e, path = %path.display(), "failed to replace event log");
        }
    }
}

fn load_log(path: &PathBuf, max_per_peer: usize) -> HashMap<String, Vec<EventRecord>> {
    let mut events: HashMap<String, Vec<EventRecord>> = HashMap::new();
    if !path.exists() {
        return events;
    }

    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "failed to read event log");
            return events;
        }
    };

    let mut count = 0usize;
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<EventRecord>(line) {
            Ok(record) => {
                events.entry(record.scooter_id.clone()).or_default().push(record);
                count += 1;
            }
            Err(e) => tracing::warn!(error = %e, "skipping malformed event line"),
        }
    }

    // File order is oldest-first; flip to newest-first and trim.
    for list in events.values_mut() {
        list.reverse();
        list.truncate(max_per_peer);
    }

    tracing::info!(events = count, path = %path.display(), "loaded event log");
    events
}
