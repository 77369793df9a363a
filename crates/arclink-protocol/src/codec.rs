//! Payload codecs: application messages ↔ `(typeTag, bytes)`.
//!
//! The session layer never looks inside an application message. It only
//! needs something that can turn one into a type tag plus bytes, and back.
//! That something is the [`PayloadCodec`] trait.
//!
//! The tag travels on every LOGIC_MESSAGE and SYNC_REQUEST/RESPONSE, so
//! routing is an explicit table lookup ([`Dispatcher`](crate::Dispatcher)),
//! never a guess based on the runtime type of a value.

use std::collections::HashSet;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// An application message that knows its own wire type tag.
pub trait Tagged {
    /// The type tag for this value. Must be stable across processes.
    fn tag(&self) -> u32;
}

/// Converts application messages to and from `(typeTag, bytes)`.
///
/// ## Trait bounds
///
/// - `Send + Sync + 'static` → one codec is shared by every session
///   registered with it and may be held in an `Arc` across threads.
///
/// A codec is configured once with its full type↔tag mapping before first
/// use and is immutable afterwards, which is why both methods take `&self`.
pub trait PayloadCodec: Send + Sync + 'static {
    /// The application message type this codec produces.
    type Message;

    /// Serializes a message into its type tag and body.
    ///
    /// # Errors
    /// Returns a [`ProtocolError`] if the message can't be represented.
    fn encode(&self, msg: &Self::Message) -> Result<(u32, Vec<u8>), ProtocolError>;

    /// Deserializes a body carried under `tag`.
    ///
    /// # Errors
    /// Returns a [`ProtocolError`] for unknown tags or malformed bodies.
    fn decode(&self, tag: u32, data: &[u8]) -> Result<Self::Message, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`PayloadCodec`] that stores message bodies as JSON (via `serde_json`).
///
/// JSON is human-readable, which is handy when tailing a packet capture
/// between two backend processes. The tag set is fixed at construction:
/// encoding or decoding a tag outside that set fails with
/// [`ProtocolError::UnknownTag`].
///
/// ## Example
///
/// ```rust
/// use arclink_protocol::{JsonCodec, PayloadCodec, Tagged};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// enum Cmd {
///     Ping(u32),
/// }
///
/// impl Tagged for Cmd {
///     fn tag(&self) -> u32 {
///         match self {
///             Cmd::Ping(_) => 1,
///         }
///     }
/// }
///
/// let codec = JsonCodec::<Cmd>::new([1]);
/// let (tag, bytes) = codec.encode(&Cmd::Ping(5)).unwrap();
/// assert_eq!(codec.decode(tag, &bytes).unwrap(), Cmd::Ping(5));
/// ```
#[cfg(feature = "json")]
pub struct JsonCodec<M> {
    tags: HashSet<u32>,
    // `fn() -> M` keeps the codec Send + Sync regardless of `M`.
    _marker: PhantomData<fn() -> M>,
}

#[cfg(feature = "json")]
impl<M> JsonCodec<M> {
    /// Creates a codec that accepts exactly the given tags.
    pub fn new(tags: impl IntoIterator<Item = u32>) -> Self {
        Self {
            tags: tags.into_iter().collect(),
            _marker: PhantomData,
        }
    }

    /// Whether `tag` was registered.
    pub fn knows(&self, tag: u32) -> bool {
        self.tags.contains(&tag)
    }
}

#[cfg(feature = "json")]
impl<M> std::fmt::Debug for JsonCodec<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonCodec").field("tags", &self.tags).finish()
    }
}

#[cfg(feature = "json")]
impl<M> PayloadCodec for JsonCodec<M>
where
    M: Tagged + Serialize + DeserializeOwned + 'static,
{
    type Message = M;

    fn encode(&self, msg: &M) -> Result<(u32, Vec<u8>), ProtocolError> {
        let tag = msg.tag();
        if !self.knows(tag) {
            return Err(ProtocolError::UnknownTag(tag));
        }
        let bytes = serde_json::to_vec(msg).map_err(ProtocolError::Encode)?;
        Ok((tag, bytes))
    }

    fn decode(&self, tag: u32, data: &[u8]) -> Result<M, ProtocolError> {
        if !self.knows(tag) {
            return Err(ProtocolError::UnknownTag(tag));
        }
        let msg: M = serde_json::from_slice(data).map_err(ProtocolError::Decode)?;
        if msg.tag() != tag {
            return Err(ProtocolError::TagMismatch {
                wire: tag,
                payload: msg.tag(),
            });
        }
        Ok(msg)
    }
}
