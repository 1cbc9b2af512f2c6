//! uplink-core — wire protocol frames and configuration.
//! All other uplink crates depend on this one.

pub mod config;
pub mod protocol;

pub use config::{ClientEntry, Config, ConfigError};
pub use protocol::{ClientFrame, ServerFrame};
