//! Error types for the protocol layer.
//!
//! Two enums, because the two kinds of failure are handled very differently:
//!
//! - [`FrameError`]: the byte stream itself is broken (bad checksum,
//!   unknown type tag, truncated payload). The only safe reaction is to
//!   close the connection.
//! - [`ProtocolError`]: one application payload could not be encoded or
//!   decoded. The message is dropped and the connection carries on.

/// Errors raised while framing or unframing wire messages.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The underlying socket failed. Required by `tokio_util::codec`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The declared frame length exceeds the configured maximum.
    #[error("frame too large: max {max} got {got}")]
    TooLarge { max: usize, got: usize },

    /// The declared frame length cannot even hold a checksum and a tag.
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    /// The CRC-32C over tag and payload didn't match the header.
    #[error("checksum mismatch: expected {expected:#010x} got {got:#010x}")]
    ChecksumMismatch { expected: u32, got: u32 },

    /// The type tag names no known wire message.
    #[error("unknown wire type {0}")]
    UnknownType(u8),

    /// The payload is shorter than its fixed fields, or a field is invalid.
    #[error("malformed {kind}: {reason}")]
    Malformed {
        kind: &'static str,
        reason: &'static str,
    },
}

/// Errors raised by payload codecs and the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning an application message into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into an application message).
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The codec was never told about this type tag.
    #[error("unknown message tag {0}")]
    UnknownTag(u32),

    /// The bytes decoded to a message whose own tag disagrees with the
    /// tag carried on the wire.
    #[error("tag mismatch: wire says {wire}, payload says {payload}")]
    TagMismatch { wire: u32, payload: u32 },

    /// A tag was registered twice in a dispatcher.
    #[error("handler already registered for tag {0}")]
    DuplicateHandler(u32),

    /// The message is invalid at the protocol level.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
