//! Session configuration and local identity.

use std::time::Duration;

use arclink_protocol::{PeerId, Role};

/// Who this process is. Stamped into every token it issues or accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub id: PeerId,
    pub role: Role,
}

impl Identity {
    pub fn new(id: PeerId, role: Role) -> Self {
        Self { id, role }
    }
}

/// Timeouts and limits for every session manager.
///
/// One config is shared by the client, server, and sync managers of a
/// process. Defaults suit backend processes on one LAN.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long one TCP connect may take before it's retried.
    pub connect_timeout: Duration,

    /// Consecutive connect attempts without reaching `Verified` before a
    /// client session is given up on.
    pub max_connect_attempts: u32,

    /// How long a client waits for its CONNECT_RESPONSE.
    pub verify_timeout: Duration,

    /// How long a sent message may stay unacknowledged before the client
    /// presumes the peer unreachable and reconnects.
    pub ack_timeout: Duration,

    /// Idle time after which a heartbeat is sent. Keep it well below
    /// `ack_timeout` and `session_timeout`.
    pub heartbeat_interval: Duration,

    /// Server side: silence after which a session is swept.
    pub session_timeout: Duration,

    /// Sent-unacked plus not-yet-sent messages a session may hold.
    /// Reaching it removes the session.
    pub max_cached_messages: usize,

    /// How long a login token is accepted after it was issued.
    pub login_token_ttl: Duration,

    /// How long a forbidden record stays in force.
    pub forbid_window: Duration,

    /// How often expired forbidden records are purged.
    pub forbid_sweep_interval: Duration,

    /// Sync RPC: how long one attempt waits for its response.
    pub request_timeout: Duration,

    /// Sync RPC: attempts per request, including the first.
    pub request_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            max_connect_attempts: 10,
            verify_timeout: Duration::from_secs(3),
            ack_timeout: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(5),
            session_timeout: Duration::from_secs(15),
            max_cached_messages: 10_000,
            login_token_ttl: Duration::from_secs(60),
            forbid_window: Duration::from_secs(300),
            forbid_sweep_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(3),
            request_retries: 3,
        }
    }
}
