//! Fixtures shared by the unit tests of this crate.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arclink_protocol::{JsonCodec, PayloadCodec, PeerId, ProtocolError, Tagged};
use arclink_tick::TickClock;
use arclink_transport::memory::MemoryNetwork;
use arclink_transport::{Network, NetEvent};
use serde::{Deserialize, Serialize};

use crate::{DisconnectReason, SessionListener, TokenService, XorCipher};

/// Unix time all tests start at.
pub const T0: u64 = 1_700_000_000;

pub fn clock() -> TickClock {
    TickClock::at(Instant::now(), T0)
}

pub fn tokens() -> TokenService {
    TokenService::new(Arc::new(XorCipher::default()), Duration::from_secs(60))
}

pub fn network() -> (Arc<MemoryNetwork>, Arc<dyn Network>) {
    let mem = Arc::new(MemoryNetwork::new());
    let dyn_net: Arc<dyn Network> = mem.clone();
    (mem, dyn_net)
}

/// Payloads are plain UTF-8 strings under tag 1.
pub struct TextCodec;

impl PayloadCodec for TextCodec {
    type Message = String;

    fn encode(&self, msg: &String) -> Result<(u32, Vec<u8>), ProtocolError> {
        Ok((1, msg.as_bytes().to_vec()))
    }

    fn decode(&self, tag: u32, data: &[u8]) -> Result<String, ProtocolError> {
        if tag != 1 {
            return Err(ProtocolError::UnknownTag(tag));
        }
        String::from_utf8(data.to_vec()).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
    }
}

pub fn codec() -> Arc<dyn PayloadCodec<Message = String>> {
    Arc::new(TextCodec)
}

/// Request/response pair for sync RPC tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rpc {
    Ask(String),
    Answer(String),
}

impl Tagged for Rpc {
    fn tag(&self) -> u32 {
        match self {
            Rpc::Ask(_) => 10,
            Rpc::Answer(_) => 11,
        }
    }
}

pub fn rpc_codec() -> Arc<dyn PayloadCodec<Message = Rpc>> {
    Arc::new(JsonCodec::<Rpc>::new([10, 11]))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Connected(PeerId),
    Disconnected(PeerId, DisconnectReason),
    Message(PeerId, String),
}

/// A listener that records every callback. Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct Recorder(Rc<RefCell<Vec<Seen>>>);

impl Recorder {
    pub fn take(&self) -> Vec<Seen> {
        std::mem::take(&mut *self.0.borrow_mut())
    }
}

impl SessionListener<String> for Recorder {
    fn on_connected(&mut self, peer: PeerId) {
        self.0.borrow_mut().push(Seen::Connected(peer));
    }

    fn on_disconnected(&mut self, peer: PeerId, reason: DisconnectReason) {
        self.0.borrow_mut().push(Seen::Disconnected(peer, reason));
    }

    fn on_message(&mut self, peer: PeerId, message: String) {
        self.0.borrow_mut().push(Seen::Message(peer, message));
    }
}

/// Shorthand for an inbound event.
pub fn inbound(conn: u64, peer: PeerId, message: arclink_protocol::WireMessage) -> NetEvent {
    NetEvent::Inbound {
        conn: arclink_transport::ConnectionId::new(conn),
        peer,
        message,
    }
}
