//! Session tokens and the service that issues them.
//!
//! A [`Token`] is the credential a client presents in every
//! CONNECT_REQUEST. It proves *continuity*: the server hands out a freshly
//! rotated token on each successful handshake, and only the current token
//! (or, until the new one is confirmed, the previous one) may reconnect.
//!
//! ```text
//!   login token (verified_count = 0)
//!        │  LOGIN accepted
//!        ▼
//!   token #1 ──RECONNECT──▶ token #2 ──RECONNECT──▶ token #3 ...
//! ```
//!
//! `created_at_sec` orders tokens for one principal. Rotation guarantees
//! it strictly increases, even for two rotations within the same second.

use std::sync::Arc;
use std::time::Duration;

use arclink_protocol::{PeerId, Role};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{SessionError, TokenCipher};

/// An immutable session credential.
///
/// Two tokens are the same token iff every field is equal, which is
/// exactly what the derived `PartialEq` checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub client_id: PeerId,
    pub client_role: Role,
    pub server_id: PeerId,
    pub server_role: Role,
    pub verified_count: u32,
    pub created_at_sec: u64,
}

impl Token {
    /// A login token: `verified_count == 0`.
    pub fn is_login(&self) -> bool {
        self.verified_count == 0
    }

    /// Field-wise equality.
    pub fn same_token(&self, other: &Token) -> bool {
        self == other
    }
}

/// Issues, rotates, seals, and opens tokens.
///
/// Cheap to clone; the cipher is shared.
#[derive(Clone)]
pub struct TokenService {
    cipher: Arc<dyn TokenCipher>,
    login_ttl: Duration,
}

impl TokenService {
    /// How far a login token's timestamp may run ahead of our clock.
    pub const MAX_CLOCK_SKEW_SECS: u64 = 5;

    pub fn new(cipher: Arc<dyn TokenCipher>, login_ttl: Duration) -> Self {
        Self { cipher, login_ttl }
    }

    /// A login token from `client` to `server`.
    pub fn new_login(
        &self,
        client: (PeerId, Role),
        server: (PeerId, Role),
        now_sec: u64,
    ) -> Token {
        Token {
            client_id: client.0,
            client_role: client.1,
            server_id: server.0,
            server_role: server.1,
            verified_count: 0,
            created_at_sec: now_sec,
        }
    }

    /// The successor of `prev`.
    pub fn rotate(&self, prev: &Token, now_sec: u64) -> Token {
        Token {
            verified_count: prev.verified_count.saturating_add(1),
            created_at_sec: now_sec.max(prev.created_at_sec.saturating_add(1)),
            ..prev.clone()
        }
    }

    /// Whether a token claims to be from further in the future than clock
    /// skew between processes explains.
    pub fn is_from_future(&self, token: &Token, now_sec: u64) -> bool {
        token.created_at_sec > now_sec.saturating_add(Self::MAX_CLOCK_SKEW_SECS)
    }

    /// Whether a login token is too old to be accepted.
    pub fn is_login_expired(&self, token: &Token, now_sec: u64) -> bool {
        now_sec.saturating_sub(token.created_at_sec) > self.login_ttl.as_secs()
    }

    /// JSON-encodes and obfuscates a token for the wire.
    ///
    /// # Errors
    /// [`SessionError::TokenEncoding`] if serialization fails.
    pub fn encrypt(&self, token: &Token) -> Result<Bytes, SessionError> {
        let text = serde_json::to_vec(token).map_err(SessionError::TokenEncoding)?;
        Ok(Bytes::from(self.cipher.encrypt(&text)))
    }

    /// Reverses [`encrypt`](Self::encrypt). Anything that doesn't decode
    /// to a well-formed token is simply `None`.
    pub fn decrypt(&self, sealed: &[u8]) -> Option<Token> {
        serde_json::from_slice(&self.cipher.decrypt(sealed)).ok()
    }
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("login_ttl", &self.login_ttl)
            .finish_non_exhaustive()
    }
}

// =========================================================================
// Tests
// =========================================================================
