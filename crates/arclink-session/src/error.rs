//! Error types for the session layer.
//!
//! Most failures inside a session never surface here: timeouts reconnect,
//! desyncs remove the session and fire `on_disconnected`. What's left are
//! mistakes by the caller and codec failures on outbound messages.

use arclink_protocol::{PeerId, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session is registered for this peer.
    #[error("no session for peer {0}")]
    UnknownPeer(PeerId),

    /// `register` was called twice for the same peer.
    #[error("peer {0} is already registered")]
    AlreadyRegistered(PeerId),

    /// The payload codec rejected an outbound message.
    #[error("payload codec failed: {0}")]
    Codec(#[from] ProtocolError),

    /// Sending would exceed the cached-message cap. The session has been
    /// removed.
    #[error("peer {0} exceeded the cached-message cap")]
    CacheOverflow(PeerId),

    /// A token could not be serialized.
    #[error("token encoding failed: {0}")]
    TokenEncoding(#[source] serde_json::Error),
}
