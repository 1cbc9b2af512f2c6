//! uplink-store — the connection-and-fanout core.
//!
//! Owns the session model, the connection registry with presence
//! fan-out, the durable state and event stores, command dispatch and
//! response parking, and the auth directory. Everything here is
//! transport-agnostic; the daemon crate wires it to WebSockets.

pub mod auth;
pub mod command;
pub mod event_store;
pub mod meter;
pub mod registry;
pub mod response_store;
pub mod session;
pub mod state_store;

pub use auth::{AuthDirectory, AuthError};
pub use command::{CommandError, CommandRouter};
pub use event_store::{EventRecord, EventStore};
pub use meter::WireMeter;
pub use registry::{ConnectionRegistry, Presence, RegistryError, RegistryStats};
pub use response_store::{ResponseRecord, ResponseStore};
pub use session::{Session, SessionStats, OUTBOUND_QUEUE_CAPACITY};
pub use state_store::{PeerState, StateStore, StateUpdate, UpdateKind};
