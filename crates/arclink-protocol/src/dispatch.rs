//! Tag → handler routing table.

use std::collections::HashMap;

use crate::{PeerId, ProtocolError, Tagged};

type HandlerFn<M, R> = dyn FnMut(PeerId, M) -> R;

/// Routes application messages to handlers by their [`Tagged::tag`].
///
/// Lives on the logic thread, so handlers are `FnMut` and need no locking.
/// `R` is whatever a handler produces: `()` for fire-and-forget logic
/// messages, the response message for sync RPC handlers.
pub struct Dispatcher<M, R = ()> {
    handlers: HashMap<u32, Box<HandlerFn<M, R>>>,
}

impl<M: Tagged, R> Dispatcher<M, R> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers the handler for `tag`.
    ///
    /// # Errors
    /// [`ProtocolError::DuplicateHandler`] if `tag` already has one.
    pub fn register<F>(&mut self, tag: u32, handler: F) -> Result<(), ProtocolError>
    where
        F: FnMut(PeerId, M) -> R + 'static,
    {
        if self.handlers.contains_key(&tag) {
            return Err(ProtocolError::DuplicateHandler(tag));
        }
        self.handlers.insert(tag, Box::new(handler));
        Ok(())
    }

    /// Whether a handler exists for `tag`.
    pub fn handles(&self, tag: u32) -> bool {
        self.handlers.contains_key(&tag)
    }

    /// Invokes the handler registered for `msg.tag()`.
    ///
    /// # Errors
    /// [`ProtocolError::UnknownTag`] if nothing is registered.
    pub fn dispatch(&mut self, from: PeerId, msg: M) -> Result<R, ProtocolError> {
        let tag = msg.tag();
        let handler = self
            .handlers
            .get_mut(&tag)
            .ok_or(ProtocolError::UnknownTag(tag))?;
        Ok(handler(from, msg))
    }
}

impl<M: Tagged, R> Default for Dispatcher<M, R> {
    fn default() -> Self {
        Self::new()
    }
}
