//! Identity types shared by every layer.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// A unique identifier for a backend process.
///
/// Ids are handed out by the discovery/id-allocation service; this layer
/// only compares them. Newtype so a `PeerId` can never be confused with a
/// sequence number or a request id, all of which are `u64` on the wire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// The kind of server a process runs as.
///
/// Tokens name the role of both ends, so a token issued for a scene server
/// cannot be replayed against a warzone server that happens to reuse the
/// same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Center,
    Scene,
    Warzone,
    Game,
    Gate,
}

impl Role {
    /// Compact numeric form used in logs and configuration.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Center => 1,
            Self::Scene => 2,
            Self::Warzone => 3,
            Self::Game => 4,
            Self::Gate => 5,
        }
    }

    /// Inverse of [`as_u8`](Self::as_u8).
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Center),
            2 => Some(Self::Scene),
            3 => Some(Self::Warzone),
            4 => Some(Self::Game),
            5 => Some(Self::Gate),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Center => write!(f, "center"),
            Self::Scene => write!(f, "scene"),
            Self::Warzone => write!(f, "warzone"),
            Self::Game => write!(f, "game"),
            Self::Gate => write!(f, "gate"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display() {
        assert_eq!(PeerId(7).to_string(), "N-7");
    }

    #[test]
    fn test_role_u8_roundtrip_covers_every_variant() {
        for role in [Role::Center, Role::Scene, Role::Warzone, Role::Game, Role::Gate] {
            assert_eq!(Role::from_u8(role.as_u8()), Some(role));
        }
        assert_eq!(Role::from_u8(0), None);
        assert_eq!(Role::from_u8(200), None);
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Warzone).unwrap();
        assert_eq!(json, "\"warzone\"");
    }
}
