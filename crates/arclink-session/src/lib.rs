//! Reliable sessions and sync RPC between backend processes.
//!
//! Everything here runs on the single logic thread. Sockets are somebody
//! else's problem ([`arclink_transport`]); this crate decides what to send
//! and what the peer's messages mean.
//!
//! 1. **Delivery**: [`MessageQueue`] numbers outbound messages, tracks acks,
//!    and keeps unacked messages for replay.
//! 2. **Credentials**: [`TokenService`] issues and rotates [`Token`]s;
//!    [`ForbiddenTable`] makes sure a retired token never comes back.
//! 3. **Sessions**: [`ClientManager`] dials and keeps sessions alive;
//!    [`ServerManager`] accepts them. Reconnects are invisible to the
//!    application, which sees one [`SessionListener::on_connected`] and one
//!    [`SessionListener::on_disconnected`] per session.
//! 4. **Sync RPC**: [`SyncClient`] and [`SyncServer`], one blocking request
//!    at a time over the same handshake.
//!
//! # How it fits in the stack
//!
//! ```text
//! Application (above)  ← listeners, handlers, send/request
//!     ↕
//! Session Layer (this crate)  ← handshake, tokens, seq/ack, replay
//!     ↕
//! Transport (below)  ← connections, frames, hand-off lanes
//! ```
//!
//! Nothing reads the wall clock directly: every entry point takes a
//! [`TickClock`](arclink_tick::TickClock), so tests drive time by hand.

mod cipher;
mod client;
mod config;
mod error;
mod forbidden;
pub mod handshake;
mod listener;
pub mod machine;
pub mod queue;
mod server;
mod sync_client;
mod sync_server;
mod token;

#[cfg(test)]
mod testing;

pub use cipher::{TokenCipher, XorCipher};
pub use client::{ClientManager, ClientSession, Registration};
pub use config::{Identity, SessionConfig};
pub use error::SessionError;
pub use forbidden::{ForbiddenRecord, ForbiddenTable};
pub use handshake::RejectReason;
pub use listener::{DisconnectReason, SessionListener};
pub use machine::{ClientState, ServerPhase};
pub use queue::MessageQueue;
pub use server::ServerManager;
pub use sync_client::SyncClient;
pub use sync_server::SyncServer;
pub use token::{Token, TokenService};
