//! Wire protocol for arclink.
//!
//! This crate defines the "language" that two backend processes speak
//! over a plain TCP socket:
//!
//! - **Identity** ([`PeerId`], [`Role`]): who is on each end of a link.
//! - **Wire messages** ([`WireMessage`] and its payload structs): the
//!   handshake, reliable-delivery and sync-RPC messages.
//! - **Framing** ([`FrameCodec`]): `[totalLength][checksum][typeTag][payload]`
//!   frames, as a `tokio_util` codec.
//! - **Handshake gate** ([`HandshakeGate`]): per-connection guard that
//!   refuses traffic before a handshake.
//! - **Payload codecs** ([`PayloadCodec`], [`JsonCodec`]) and the
//!   tag→handler [`Dispatcher`], the narrow interface to application
//!   message types.
//!
//! # Architecture
//!
//! The protocol layer doesn't know about sockets or sessions. It only knows
//! how bytes become typed messages and back.
//!
//! ```text
//! Transport (bytes) → Protocol (WireMessage) → Session (sequence, ack, token)
//! ```

mod codec;
mod dispatch;
mod error;
mod frame;
mod gate;
mod types;
mod wire;

pub use codec::{PayloadCodec, Tagged};
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use dispatch::Dispatcher;
pub use error::{FrameError, ProtocolError};
pub use frame::{DEFAULT_MAX_FRAME_BYTES, FRAME_HEADER_LEN, FrameCodec};
pub use gate::{GateVerdict, HandshakeGate};
pub use types::{PeerId, Role};
pub use wire::{
    AckHeartbeat, ConnectRequest, ConnectResponse, LogicMessage, SyncRequest,
    SyncResponse, WireMessage, WireType,
};
