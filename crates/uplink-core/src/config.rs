//! Server configuration, loaded from a YAML file.
//!
//! Every field has a default so a minimal config only needs the auth
//! section. Durations are integer seconds; zero disables the feature
//! where the field documents it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port serving the WebSocket endpoints and the REST API.
    pub ws_port: u16,
    /// Serve the operator page at `/` when true.
    pub enable_web_ui: bool,
    /// Interval between server keepalive frames, seconds.
    pub keepalive_interval_secs: u64,
    /// Maximum concurrent peer connections. 0 = unlimited.
    pub max_connections: usize,
    /// Per-peer inbound frames per second. 0 = unlimited.
    pub message_rate_limit: u32,
    /// Disconnect a peer after this long without a frame, seconds. 0 = disabled.
    pub idle_timeout_secs: u64,
}

/// Per-client credentials and optional display name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientEntry {
    pub token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared key for the REST API and the observer WebSocket.
    pub api_key: String,
    /// identifier -> credentials.
    pub tokens: BTreeMap<String, ClientEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Snapshot of all peer states, rewritten on every mutation.
    pub state_path: PathBuf,
    /// Append-only event log, one JSON object per line.
    pub events_path: PathBuf,
    /// Per-peer event cap; overflow trims the oldest.
    pub max_events_per_peer: usize,
    /// How long parked command responses are kept, seconds.
    pub response_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log filter when RUST_LOG is unset.
    pub level: String,
    /// Interval between aggregate stats log lines, seconds.
    pub stats_interval_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_port: 8080,
            enable_web_ui: true,
            keepalive_interval_secs: 300,
            max_connections: 0,
            message_rate_limit: 0,
            idle_timeout_secs: 0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("data/state.json"),
            events_path: PathBuf::from("data/events.jsonl"),
            max_events_per_peer: 1000,
            response_ttl_secs: 3600,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            stats_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    /// None when idle disconnection is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

impl StorageConfig {
    pub fn response_ttl(&self) -> Duration {
        Duration::from_secs(self.response_ttl_secs)
    }
}

impl LoggingConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, serde_yaml::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(serde_yaml::Error),
}

// ── Loading / saving ──────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        serde_yaml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = serde_yaml::to_string(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.ws_port, 8080);
        assert_eq!(config.server.keepalive_interval_secs, 300);
        assert_eq!(config.server.max_connections, 0);
        assert_eq!(config.server.idle_timeout(), None);
        assert_eq!(config.storage.max_events_per_peer, 1000);
        assert_eq!(config.storage.response_ttl_secs, 3600);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn minimal_yaml_fills_defaults() {
        let yaml = r#"
auth:
  api_key: "k"
  tokens:
    scooter-1:
      token: "t1"
      name: "Test Scooter"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.ws_port, 8080);
        assert_eq!(config.auth.api_key, "k");
        let entry = &config.auth.tokens["scooter-1"];
        assert_eq!(entry.token, "t1");
        assert_eq!(entry.name, "Test Scooter");
    }

    #[test]
    fn idle_timeout_enabled_when_nonzero() {
        let mut config = Config::default();
        config.server.idle_timeout_secs = 90;
        assert_eq!(config.server.idle_timeout(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");

        let mut config = Config::default();
        config.auth.api_key = "secret".to_string();
        config.auth.tokens.insert(
            "s1".to_string(),
            ClientEntry {
                token: "tok".to_string(),
                name: String::new(),
            },
        );
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.auth.api_key, "secret");
        assert_eq!(loaded.auth.tokens["s1"].token, "tok");
    }

    #[test]
    fn load_missing_file_errors() {
        assert!(Config::load("/nonexistent/config.yml").is_err());
    }
}
