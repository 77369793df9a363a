//! The upward interface: what the application sees of a session.

use std::fmt;

use arclink_protocol::PeerId;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Explicit `remove_session`, e.g. the discovery service saw the peer go.
    Removed,
    /// No traffic within the session timeout.
    Timeout,
    /// The cached-message cap was reached.
    CacheOverflow,
    /// Sequence/ack state diverged, or the peer broke the handshake order.
    ProtocolDesync,
    /// A newer login from the same peer replaced this session.
    Superseded,
    /// Too many connect attempts without reaching the peer.
    ConnectFailed,
    /// The server no longer accepts our rotated token.
    Rejected,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Removed => "removed",
            Self::Timeout => "timeout",
            Self::CacheOverflow => "cache overflow",
            Self::ProtocolDesync => "protocol desync",
            Self::Superseded => "superseded",
            Self::ConnectFailed => "connect failed",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Lifecycle callbacks and message delivery for one session (client side)
/// or for every session of a server manager.
///
/// Runs on the logic thread. `on_connected` and `on_disconnected` each
/// fire at most once per session, never for transient reconnects.
pub trait SessionListener<M> {
    fn on_connected(&mut self, _peer: PeerId) {}

    fn on_disconnected(&mut self, _peer: PeerId, _reason: DisconnectReason) {}

    /// A message delivered in order, exactly once.
    fn on_message(&mut self, peer: PeerId, message: M);
}
