//! # Arclink
//!
//! Reliable, authenticated links between the processes of a game backend.
//!
//! Each process runs one [`Node`]: it dials the peers the discovery layer
//! announces, accepts the peers that dial it, and keeps every link alive
//! across dropped sockets. Messages are sequenced and acknowledged, replayed
//! after a reconnect, and delivered in order exactly once. Links are
//! authenticated by rotating tokens, and a small synchronous RPC variant
//! covers request/response calls that must block.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use arclink::prelude::*;
//!
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct Chat(String);
//! # impl Tagged for Chat { fn tag(&self) -> u32 { 1 } }
//! # struct Log;
//! # impl SessionListener<Chat> for Log { fn on_message(&mut self, _: PeerId, _: Chat) {} }
//! # fn main() -> Result<(), ArclinkError> {
//! let config = NodeConfig::from_json_file("node.json")?;
//! init_tracing(&config.log_level);
//!
//! let codec = Arc::new(JsonCodec::<Chat>::new([1]));
//! let mut node = Node::new(&config, codec.clone(), Box::new(Log))?;
//! node.listen("0.0.0.0:7000")?;
//! node.register(
//!     Registration::new(PeerId(1), Role::Center, "10.0.0.1", 7000),
//!     codec,
//!     Box::new(Log),
//! )?;
//! loop {
//!     node.step();
//! }
//! # }
//! ```

mod config;
mod error;
pub mod logging;
mod node;

pub use config::NodeConfig;
pub use error::ArclinkError;
pub use node::Node;

pub use arclink_protocol as protocol;
pub use arclink_session as session;
pub use arclink_tick as tick;
pub use arclink_transport as transport;

/// The types most applications need.
pub mod prelude {
    pub use crate::logging::init_tracing;
    pub use crate::{ArclinkError, Node, NodeConfig};
    pub use arclink_protocol::{JsonCodec, PayloadCodec, PeerId, Role, Tagged};
    pub use arclink_session::{
        ClientState, DisconnectReason, Registration, SessionListener, Token,
    };
    pub use arclink_tick::TickClock;
}
