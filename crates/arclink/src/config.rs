//! Node configuration.
//!
//! [`NodeConfig`] is the one file a deployment edits. It flattens the
//! settings of every layer into JSON-friendly fields (durations in
//! milliseconds) and converts into the per-crate config structs. Missing
//! fields take their defaults, so `{"id": 7, "role": "scene"}` is a
//! complete config.

use std::path::Path;
use std::time::Duration;

use arclink_protocol::{DEFAULT_MAX_FRAME_BYTES, PeerId, Role};
use arclink_session::{Identity, SessionConfig};
use arclink_tick::TickConfig;
use arclink_transport::TransportConfig;
use serde::Deserialize;

use crate::ArclinkError;

/// Everything needed to start a [`Node`](crate::Node).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// This process's id, unique across the backend.
    pub id: u64,
    /// What kind of server this process runs as.
    pub role: Role,
    /// Shared key for token sealing. Empty uses the built-in key.
    pub token_key: String,
    /// Tracing filter used when `RUST_LOG` is unset.
    pub log_level: String,

    // Transport
    pub io_threads: usize,
    pub max_frame_bytes: usize,
    pub nodelay: bool,
    /// Capacity of each I/O to logic hand-off queue.
    pub handoff_capacity: usize,

    // Tick
    pub tick_rate_hz: u32,
    pub initial_jitter_us: u64,

    // Sessions
    pub connect_timeout_ms: u64,
    pub max_connect_attempts: u32,
    pub verify_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub session_timeout_ms: u64,
    pub max_cached_messages: usize,
    pub login_token_ttl_ms: u64,
    pub forbid_window_ms: u64,
    pub forbid_sweep_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub request_retries: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        let transport = TransportConfig::default();
        let tick = TickConfig::default();
        Self {
            id: 0,
            role: Role::Center,
            token_key: String::new(),
            log_level: crate::logging::DEFAULT_FILTER.to_string(),
            io_threads: transport.io_threads,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            nodelay: transport.nodelay,
            handoff_capacity: 65_536,
            tick_rate_hz: tick.tick_rate_hz,
            initial_jitter_us: tick.initial_jitter_us,
            connect_timeout_ms: millis(session.connect_timeout),
            max_connect_attempts: session.max_connect_attempts,
            verify_timeout_ms: millis(session.verify_timeout),
            ack_timeout_ms: millis(session.ack_timeout),
            heartbeat_interval_ms: millis(session.heartbeat_interval),
            session_timeout_ms: millis(session.session_timeout),
            max_cached_messages: session.max_cached_messages,
            login_token_ttl_ms: millis(session.login_token_ttl),
            forbid_window_ms: millis(session.forbid_window),
            forbid_sweep_interval_ms: millis(session.forbid_sweep_interval),
            request_timeout_ms: millis(session.request_timeout),
            request_retries: session.request_retries,
        }
    }
}

impl NodeConfig {
    /// Reads a JSON config file.
    ///
    /// # Errors
    /// [`ArclinkError::ConfigRead`] if the file can't be read,
    /// [`ArclinkError::ConfigParse`] if it isn't a valid config.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ArclinkError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Parses a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, ArclinkError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn identity(&self) -> Identity {
        Identity::new(PeerId(self.id), self.role)
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            max_connect_attempts: self.max_connect_attempts,
            verify_timeout: Duration::from_millis(self.verify_timeout_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            session_timeout: Duration::from_millis(self.session_timeout_ms),
            max_cached_messages: self.max_cached_messages,
            login_token_ttl: Duration::from_millis(self.login_token_ttl_ms),
            forbid_window: Duration::from_millis(self.forbid_window_ms),
            forbid_sweep_interval: Duration::from_millis(self.forbid_sweep_interval_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            request_retries: self.request_retries,
        }
    }

    /// The socket connect timeout matches the session's, so a dial that
    /// hangs reports `ConnectFailed` before the session gives up on it.
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            io_threads: self.io_threads,
            max_frame_bytes: self.max_frame_bytes,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            nodelay: self.nodelay,
        }
    }

    pub fn tick(&self) -> TickConfig {
        TickConfig {
            tick_rate_hz: self.tick_rate_hz,
            initial_jitter_us: self.initial_jitter_us,
            ..TickConfig::default()
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Defaults
    // =========================================================================

    #[test]
    fn test_default_session_matches_session_crate_defaults() {
        let session = NodeConfig::default().session();
        let expected = SessionConfig::default();
        assert_eq!(session.connect_timeout, expected.connect_timeout);
        assert_eq!(session.heartbeat_interval, expected.heartbeat_interval);
        assert_eq!(session.forbid_window, expected.forbid_window);
        assert_eq!(session.max_cached_messages, expected.max_cached_messages);
        assert_eq!(session.request_retries, expected.request_retries);
    }

    #[test]
    fn test_default_handoff_capacity_is_65536() {
        assert_eq!(NodeConfig::default().handoff_capacity, 65_536);
    }

    // =========================================================================
    // Parsing
    // =========================================================================

    #[test]
    fn test_from_json_str_minimal_fills_defaults() {
        let config = NodeConfig::from_json_str(r#"{"id": 7, "role": "scene"}"#).unwrap();
        assert_eq!(config.identity(), Identity::new(PeerId(7), Role::Scene));
        assert_eq!(config.tick_rate_hz, TickConfig::default().tick_rate_hz);
        assert_eq!(config.session_timeout_ms, 15_000);
    }

    #[test]
    fn test_from_json_str_durations_are_milliseconds() {
        let config = NodeConfig::from_json_str(
            r#"{"heartbeat_interval_ms": 250, "connect_timeout_ms": 1500}"#,
        )
        .unwrap();
        assert_eq!(config.session().heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.transport().connect_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_from_json_str_unknown_field_rejected() {
        let err = NodeConfig::from_json_str(r#"{"heartbeat": 5}"#).unwrap_err();
        assert!(matches!(err, ArclinkError::ConfigParse(_)));
    }

    #[test]
    fn test_from_json_file_missing_file_is_read_error() {
        let err = NodeConfig::from_json_file("/nonexistent/arclink.json").unwrap_err();
        assert!(matches!(err, ArclinkError::ConfigRead(_)));
    }

    #[test]
    fn test_from_json_file_reads_written_config() {
        let path = std::env::temp_dir().join(format!("arclink-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"id": 3, "role": "warzone", "tick_rate_hz": 20}"#).unwrap();
        let config = NodeConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.id, 3);
        assert_eq!(config.role, Role::Warzone);
        assert_eq!(config.tick().tick_rate_hz, 20);
    }
}
