//! Wire messages: the payloads carried inside a frame.
//!
//! Every integer is big-endian. Variable-length fields (`token`, `body`)
//! always come last and run to the end of the payload, so no inner length
//! prefix is needed; the frame already carries one.
//!
//! ```text
//! CONNECT_REQUEST   clientId:8 serverId:8 attempt:4 ack:8 token:rest
//! CONNECT_RESPONSE  attempt:4 success:1 ack:8 token:rest
//! LOGIC_MESSAGE     ack:8 sequence:8 typeTag:4 body:rest
//! ACK_HEARTBEAT     ack:8 sequence:8
//! SYNC_REQUEST      requestId:8 typeTag:4 body:rest
//! SYNC_RESPONSE     requestId:8 typeTag:4 body:rest
//! SYNC_HEARTBEAT    (empty)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{FrameError, PeerId};

// ---------------------------------------------------------------------------
// WireType
// ---------------------------------------------------------------------------

/// The one-byte type tag that follows the checksum in every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WireType {
    ConnectRequest = 1,
    ConnectResponse = 2,
    LogicMessage = 3,
    AckHeartbeat = 4,
    SyncRequest = 5,
    SyncResponse = 6,
    SyncHeartbeat = 7,
}

impl TryFrom<u8> for WireType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::ConnectRequest,
            2 => Self::ConnectResponse,
            3 => Self::LogicMessage,
            4 => Self::AckHeartbeat,
            5 => Self::SyncRequest,
            6 => Self::SyncResponse,
            7 => Self::SyncHeartbeat,
            other => return Err(FrameError::UnknownType(other)),
        })
    }
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Client → server: "here is my token, this is how far I got."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub client_id: PeerId,
    pub server_id: PeerId,
    /// Incremented on every request the client sends, so responses to
    /// older requests can be told apart.
    pub attempt: u32,
    /// Highest sequence the client has received from the server.
    pub ack: u64,
    /// Encrypted token bytes.
    pub token: Bytes,
}

/// Server → client: verdict on a [`ConnectRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Echo of the request's attempt counter.
    pub attempt: u32,
    pub success: bool,
    /// Highest sequence the server has received from the client.
    pub ack: u64,
    /// Freshly rotated token on success, empty on failure.
    pub token: Bytes,
}

/// An application message riding the reliable queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicMessage {
    pub ack: u64,
    pub sequence: u64,
    /// Application type tag, resolved by a [`PayloadCodec`](crate::PayloadCodec).
    pub tag: u32,
    pub body: Bytes,
}

/// Keeps the ack window moving when no application traffic flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckHeartbeat {
    pub ack: u64,
    pub sequence: u64,
}

/// A blocking request from a sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub request_id: u64,
    pub tag: u32,
    pub body: Bytes,
}

/// The answer to a [`SyncRequest`], correlated by `request_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResponse {
    pub request_id: u64,
    pub tag: u32,
    pub body: Bytes,
}

// ---------------------------------------------------------------------------
// WireMessage
// ---------------------------------------------------------------------------

/// Everything that can travel inside a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    ConnectRequest(ConnectRequest),
    ConnectResponse(ConnectResponse),
    Logic(LogicMessage),
    Heartbeat(AckHeartbeat),
    SyncRequest(SyncRequest),
    SyncResponse(SyncResponse),
    SyncHeartbeat,
}

impl WireMessage {
    /// The frame type tag for this message.
    pub fn wire_type(&self) -> WireType {
        match self {
            Self::ConnectRequest(_) => WireType::ConnectRequest,
            Self::ConnectResponse(_) => WireType::ConnectResponse,
            Self::Logic(_) => WireType::LogicMessage,
            Self::Heartbeat(_) => WireType::AckHeartbeat,
            Self::SyncRequest(_) => WireType::SyncRequest,
            Self::SyncResponse(_) => WireType::SyncResponse,
            Self::SyncHeartbeat => WireType::SyncHeartbeat,
        }
    }

    /// Appends the payload (without frame header) to `dst`.
    pub fn encode_payload(&self, dst: &mut BytesMut) {
        match self {
            Self::ConnectRequest(m) => {
                dst.reserve(28 + m.token.len());
                dst.put_u64(m.client_id.0);
                dst.put_u64(m.server_id.0);
                dst.put_u32(m.attempt);
                dst.put_u64(m.ack);
                dst.put_slice(&m.token);
            }
            Self::ConnectResponse(m) => {
                dst.reserve(13 + m.token.len());
                dst.put_u32(m.attempt);
                dst.put_u8(u8::from(m.success));
                dst.put_u64(m.ack);
                dst.put_slice(&m.token);
            }
            Self::Logic(m) => {
                dst.reserve(20 + m.body.len());
                dst.put_u64(m.ack);
                dst.put_u64(m.sequence);
                dst.put_u32(m.tag);
                dst.put_slice(&m.body);
            }
            Self::Heartbeat(m) => {
                dst.reserve(16);
                dst.put_u64(m.ack);
                dst.put_u64(m.sequence);
            }
            Self::SyncRequest(m) => {
                dst.reserve(12 + m.body.len());
                dst.put_u64(m.request_id);
                dst.put_u32(m.tag);
                dst.put_slice(&m.body);
            }
            Self::SyncResponse(m) => {
                dst.reserve(12 + m.body.len());
                dst.put_u64(m.request_id);
                dst.put_u32(m.tag);
                dst.put_slice(&m.body);
            }
            Self::SyncHeartbeat => {}
        }
    }

    /// Parses a payload of the given type.
    ///
    /// # Errors
    /// [`FrameError::Malformed`] if the payload is shorter than the fixed
    /// fields of its type, or a heartbeat carries trailing bytes.
    pub fn decode_payload(
        ty: WireType,
        mut payload: Bytes,
    ) -> Result<Self, FrameError> {
        let msg = match ty {
            WireType::ConnectRequest => {
                need(&payload, 28, "connect request")?;
                Self::ConnectRequest(ConnectRequest {
                    client_id: PeerId(payload.get_u64()),
                    server_id: PeerId(payload.get_u64()),
                    attempt: payload.get_u32(),
                    ack: payload.get_u64(),
                    token: payload,
                })
            }
            WireType::ConnectResponse => {
                need(&payload, 13, "connect response")?;
                let attempt = payload.get_u32();
                let success = match payload.get_u8() {
                    0 => false,
                    1 => true,
                    _ => {
                        return Err(FrameError::Malformed {
                            kind: "connect response",
                            reason: "success flag must be 0 or 1",
                        });
                    }
                };
                Self::ConnectResponse(ConnectResponse {
                    attempt,
                    success,
                    ack: payload.get_u64(),
                    token: payload,
                })
            }
            WireType::LogicMessage => {
                need(&payload, 20, "logic message")?;
                Self::Logic(LogicMessage {
                    ack: payload.get_u64(),
                    sequence: payload.get_u64(),
                    tag: payload.get_u32(),
                    body: payload,
                })
            }
            WireType::AckHeartbeat => {
                exact(&payload, 16, "ack heartbeat")?;
                Self::Heartbeat(AckHeartbeat {
                    ack: payload.get_u64(),
                    sequence: payload.get_u64(),
                })
            }
            WireType::SyncRequest => {
                need(&payload, 12, "sync request")?;
                Self::SyncRequest(SyncRequest {
                    request_id: payload.get_u64(),
                    tag: payload.get_u32(),
                    body: payload,
                })
            }
            WireType::SyncResponse => {
                need(&payload, 12, "sync response")?;
                Self::SyncResponse(SyncResponse {
                    request_id: payload.get_u64(),
                    tag: payload.get_u32(),
                    body: payload,
                })
            }
            WireType::SyncHeartbeat => {
                exact(&payload, 0, "sync heartbeat")?;
                Self::SyncHeartbeat
            }
        };
        Ok(msg)
    }
}

fn need(buf: &Bytes, len: usize, kind: &'static str) -> Result<(), FrameError> {
    if buf.len() < len {
        return Err(FrameError::Malformed {
            kind,
            reason: "payload shorter than fixed fields",
        });
    }
    Ok(())
}

fn exact(buf: &Bytes, len: usize, kind: &'static str) -> Result<(), FrameError> {
    if buf.len() != len {
        return Err(FrameError::Malformed {
            kind,
            reason: "payload has unexpected length",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reparse(msg: &WireMessage) -> WireMessage {
        let mut buf = BytesMut::new();
        msg.encode_payload(&mut buf);
        WireMessage::decode_payload(msg.wire_type(), buf.freeze())
            .expect("payload should parse")
    }

    #[test]
    fn test_connect_request_layout_matches_field_widths() {
        let msg = WireMessage::ConnectRequest(ConnectRequest {
            client_id: PeerId(7),
            server_id: PeerId(9),
            attempt: 3,
            ack: 42,
            token: Bytes::from_static(b"tok"),
        });
        let mut buf = BytesMut::new();
        msg.encode_payload(&mut buf);

        assert_eq!(buf.len(), 8 + 8 + 4 + 8 + 3);
        assert_eq!(&buf[0..8], &7u64.to_be_bytes());
        assert_eq!(&buf[16..20], &3u32.to_be_bytes());
        assert_eq!(&buf[28..], b"tok");
        assert_eq!(reparse(&msg), msg);
    }

    #[test]
    fn test_connect_response_rejects_bad_success_flag() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(2);
        buf.put_u64(0);

        let err = WireMessage::decode_payload(WireType::ConnectResponse, buf.freeze())
            .unwrap_err();
        assert!(matches!(err, FrameError::Malformed { .. }));
    }

    #[test]
    fn test_logic_message_with_empty_body_parses() {
        let msg = WireMessage::Logic(LogicMessage {
            ack: 1,
            sequence: 2,
            tag: 100,
            body: Bytes::new(),
        });
        assert_eq!(reparse(&msg), msg);
    }

    #[test]
    fn test_heartbeat_with_trailing_bytes_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u64(1);
        buf.put_u64(2);
        buf.put_u8(0);

        let result = WireMessage::decode_payload(WireType::AckHeartbeat, buf.freeze());
        assert!(matches!(result, Err(FrameError::Malformed { .. })));
    }

    #[test]
    fn test_truncated_sync_request_is_malformed() {
        let result = WireMessage::decode_payload(
            WireType::SyncRequest,
            Bytes::from_static(&[0, 0, 0]),
        );
        assert!(matches!(result, Err(FrameError::Malformed { .. })));
    }

    #[test]
    fn test_wire_type_from_unknown_byte_fails() {
        assert!(matches!(WireType::try_from(0), Err(FrameError::UnknownType(0))));
        assert!(matches!(WireType::try_from(8), Err(FrameError::UnknownType(8))));
        assert_eq!(WireType::try_from(3).unwrap(), WireType::LogicMessage);
    }
}
