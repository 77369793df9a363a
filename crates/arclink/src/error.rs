//! Unified error type for the arclink facade.

use arclink_protocol::ProtocolError;
use arclink_session::SessionError;
use arclink_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant lets `?` convert sub-crate
/// errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum ArclinkError {
    /// A transport-level error (runtime, bind, connect).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, handler registration).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (unknown peer, cache overflow, token sealing).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The config file could not be read.
    #[error("failed to read config: {0}")]
    ConfigRead(#[from] std::io::Error),

    /// The config file is not valid JSON for [`NodeConfig`](crate::NodeConfig).
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use arclink_protocol::PeerId;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectTimeout(std::time::Duration::from_secs(3));
        let arclink_err: ArclinkError = err.into();
        assert!(matches!(arclink_err, ArclinkError::Transport(_)));
        assert!(arclink_err.to_string().contains("3s"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::InvalidMessage("bad".into());
        let arclink_err: ArclinkError = err.into();
        assert!(matches!(arclink_err, ArclinkError::Protocol(_)));
    }

    #[test]
    fn test_from_session_error() {
        let err = SessionError::UnknownPeer(PeerId(4));
        let arclink_err: ArclinkError = err.into();
        assert!(matches!(arclink_err, ArclinkError::Session(_)));
        assert!(arclink_err.to_string().contains("N-4"));
    }

    #[test]
    fn test_from_json_error() {
        let err = serde_json::from_str::<u32>("nope").unwrap_err();
        let arclink_err: ArclinkError = err.into();
        assert!(matches!(arclink_err, ArclinkError::ConfigParse(_)));
    }
}
