//! Reversible token obfuscation.
//!
//! Tokens are not secrets in the cryptographic sense: every process of the
//! backend shares the key, and the goal is only that a token can't be
//! forged or edited by hand. [`TokenCipher`] keeps the transform
//! pluggable so a deployment can swap in something stronger.

/// A reversible byte transform applied to the token's text encoding.
pub trait TokenCipher: Send + Sync + 'static {
    fn encrypt(&self, plain: &[u8]) -> Vec<u8>;
    fn decrypt(&self, sealed: &[u8]) -> Vec<u8>;
}

/// Byte-wise XOR with a repeating fixed key.
#[derive(Debug, Clone)]
pub struct XorCipher {
    key: Vec<u8>,
}

impl XorCipher {
    /// Key used when none is configured.
    pub const DEFAULT_KEY: &'static [u8] = b"arclink/session-token/v1";

    /// An empty key would be the identity transform, so it falls back to
    /// [`DEFAULT_KEY`](Self::DEFAULT_KEY).
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        if key.is_empty() {
            return Self::default();
        }
        Self { key }
    }

    fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .zip(self.key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }
}

impl Default for XorCipher {
    fn default() -> Self {
        Self {
            key: Self::DEFAULT_KEY.to_vec(),
        }
    }
}

impl TokenCipher for XorCipher {
    fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        self.apply(plain)
    }

    fn decrypt(&self, sealed: &[u8]) -> Vec<u8> {
        self.apply(sealed)
    }
}
