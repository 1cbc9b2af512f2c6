//! Session — the server-side object for one live peer connection.
//!
//! The daemon runs three tasks per session (reader, writer, keeper).
//! The writer owns the receiving half of the outbound queue and is the
//! only task that writes frames; termination is signaled through the
//! cancellation token and never by closing the queue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use uplink_core::protocol::ServerFrame;

use crate::meter::WireMeter;

/// Bound on ordered frames waiting for the writer. Fullness fails
/// command dispatch fast and drops keepalives silently.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

pub struct Session {
    identifier: String,
    name: String,
    version: String,
    protocol_version: u32,
    authenticated: AtomicBool,
    connected_at: DateTime<Utc>,
    last_seen: RwLock<DateTime<Utc>>,

    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    telemetry_received: AtomicU64,
    commands_sent: AtomicU64,

    meter: Arc<WireMeter>,
    outbound: mpsc::Sender<ServerFrame>,
    cancel: CancellationToken,
}

/// Point-in-time counter snapshot. Atomic reads, not a coherent
/// instant across fields.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub identifier: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub authenticated: bool,
    pub connected_at: String,
    pub uptime_seconds: u64,
    pub last_seen: String,
    pub idle_seconds: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub telemetry_received: u64,
    pub commands_sent: u64,
    pub wire_bytes_sent: u64,
    pub wire_bytes_received: u64,
    pub version: String,
}

impl Session {
    /// Returns the session and the receiving half of its outbound
    /// queue. The caller hands the receiver to the writer task; nothing
    /// else may consume it.
    pub fn new(
        identifier: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        protocol_version: u32,
        meter: Arc<WireMeter>,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let now = Utc::now();
        let session = Arc::new(Self {
            identifier: identifier.into(),
            name: name.into(),
            version: version.into(),
            protocol_version,
            authenticated: AtomicBool::new(false),
            connected_at: now,
            last_seen: RwLock::new(now),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            telemetry_received: AtomicU64::new(0),
            commands_sent: AtomicU64::new(0),
            meter,
            outbound: tx,
            cancel,
        });
        (session, rx)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn meter(&self) -> &WireMeter {
        &self.meter
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    pub(crate) fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.read().expect("last_seen lock poisoned")
    }

    /// Called by the reader on every received frame.
    pub fn touch(&self) {
        *self.last_seen.write().expect("last_seen lock poisoned") = Utc::now();
    }

    /// Non-blocking enqueue. Returns false when the queue is full or
    /// the writer is gone; the caller decides whether that is fatal.
    pub fn enqueue(&self, frame: ServerFrame) -> bool {
        self.outbound.try_send(frame).is_ok()
    }

    /// Signal termination to the reader, writer and keeper. Idempotent.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    // Counters are monotone; the writer and reader are the only
    // incrementers for their respective directions.

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_telemetry_received(&self) {
        self.telemetry_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commands_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn telemetry_received(&self) -> u64 {
        self.telemetry_received.load(Ordering::Relaxed)
    }

    pub fn commands_sent(&self) -> u64 {
        self.commands_sent.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SessionStats {
        let now = Utc::now();
        let last_seen = self.last_seen();
        SessionStats {
            identifier: self.identifier.clone(),
            name: self.name.clone(),
            authenticated: self.is_authenticated(),
            connected_at: self.connected_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            uptime_seconds: (now - self.connected_at).num_seconds().max(0) as u64,
            last_seen: last_seen.to_rfc3339_opts(SecondsFormat::Secs, true),
            idle_seconds: (now - last_seen).num_seconds().max(0) as u64,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            telemetry_received: self.telemetry_received.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            wire_bytes_sent: self.meter.bytes_written(),
            wire_bytes_received: self.meter.bytes_read(),
            version: self.version.clone(),
        }
    }
}
