//! Per-connection handshake gate.
//!
//! A raw TCP connection is untrusted until it has carried a handshake
//! message. The gate sits in the I/O task, in front of the hand-off queue,
//! so unauthenticated early traffic never reaches the logic thread.
//!
//! Once the first handshake message has passed, the gate remembers the
//! remote principal and stamps it on every later message. A connection that
//! later claims a *different* principal is closed.

use crate::{PeerId, WireMessage};

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    /// We accepted the socket; expect CONNECT_REQUEST first.
    Accepted,
    /// We dialed the socket; expect CONNECT_RESPONSE first.
    Dialed,
}

/// What the I/O task should do with a decoded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    /// Forward the message, attributed to this principal.
    Pass(PeerId),
    /// Close the connection.
    Reject(&'static str),
}

/// Tracks the handshake state of one physical connection.
#[derive(Debug, Clone)]
pub struct HandshakeGate {
    side: Side,
    principal: Option<PeerId>,
    handshaken: bool,
}

impl HandshakeGate {
    /// Gate for a connection we accepted. The principal is learned from the
    /// first CONNECT_REQUEST.
    pub fn accepted() -> Self {
        Self {
            side: Side::Accepted,
            principal: None,
            handshaken: false,
        }
    }

    /// Gate for a connection we dialed to `peer`.
    pub fn dialed(peer: PeerId) -> Self {
        Self {
            side: Side::Dialed,
            principal: Some(peer),
            handshaken: false,
        }
    }

    /// The remembered principal, if any.
    pub fn principal(&self) -> Option<PeerId> {
        self.principal
    }

    /// Whether a handshake message has passed.
    pub fn is_handshaken(&self) -> bool {
        self.handshaken
    }

    /// Decides whether `msg` may be forwarded.
    pub fn admit(&mut self, msg: &WireMessage) -> GateVerdict {
        match (self.side, msg) {
            (Side::Accepted, WireMessage::ConnectRequest(req)) => {
                match self.principal {
                    None => {
                        self.principal = Some(req.client_id);
                        self.handshaken = true;
                        GateVerdict::Pass(req.client_id)
                    }
                    Some(p) if p == req.client_id => GateVerdict::Pass(p),
                    Some(_) => GateVerdict::Reject("principal changed mid-connection"),
                }
            }
            (Side::Dialed, WireMessage::ConnectResponse(_)) => {
                self.handshaken = true;
                match self.principal {
                    Some(p) => GateVerdict::Pass(p),
                    None => GateVerdict::Reject("dialed connection without peer"),
                }
            }
            (Side::Accepted, WireMessage::ConnectResponse(_)) => {
                GateVerdict::Reject("connect response on accepted connection")
            }
            (Side::Dialed, WireMessage::ConnectRequest(_)) => {
                GateVerdict::Reject("connect request on dialed connection")
            }
            (_, _) => match self.principal {
                Some(p) if self.handshaken => GateVerdict::Pass(p),
                _ => GateVerdict::Reject("traffic before handshake"),
            },
        }
    }
}
