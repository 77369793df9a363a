//! The hand-off queue between I/O threads and the logic thread.
//!
//! Many producers (one per connection task), exactly one consumer (the
//! logic thread). Built on a bounded `crossbeam_channel`, which gives us
//! lock-free MPMC with blocking receive and a timeout. The receiving half
//! is restricted to a single owner by not being `Clone`.
//!
//! # Overflow
//!
//! [`HandoffSender::push`] never blocks. When the queue is full it hands
//! the item back as [`HandoffError::Full`]; the I/O layer reacts by closing
//! the connection that produced it. Events are never dropped from the
//! middle of a connection's stream, so the reliable queue's reconnect path
//! recovers anything that was in flight.
//!
//! # Ordering
//!
//! Items come out in the order they were pushed. Two producers racing each
//! other have no defined relative order, but nothing is reordered after it
//! has been enqueued.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

/// Why a push failed. The rejected item is returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError<T> {
    /// The queue is at capacity.
    #[error("hand-off queue full")]
    Full(T),

    /// The logic thread dropped its receiver.
    #[error("hand-off queue disconnected")]
    Disconnected(T),
}

/// Creates a bounded hand-off queue.
pub fn handoff<T>(capacity: usize) -> (HandoffSender<T>, HandoffReceiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (HandoffSender { inner: tx }, HandoffReceiver { inner: rx })
}

/// Producer half. Cheap to clone, one per I/O task.
#[derive(Debug)]
pub struct HandoffSender<T> {
    inner: Sender<T>,
}

impl<T> Clone for HandoffSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> HandoffSender<T> {
    /// Enqueues without blocking.
    pub fn push(&self, item: T) -> Result<(), HandoffError<T>> {
        self.inner.try_send(item).map_err(|e| match e {
            TrySendError::Full(item) => HandoffError::Full(item),
            TrySendError::Disconnected(item) => HandoffError::Disconnected(item),
        })
    }
}

/// Consumer half, owned by the logic thread.
#[derive(Debug)]
pub struct HandoffReceiver<T> {
    inner: Receiver<T>,
}

impl<T> HandoffReceiver<T> {
    /// Drains everything that was queued when the call was made.
    ///
    /// Items pushed while the iterator is running wait for the next drain,
    /// which keeps one tick's work bounded.
    pub fn drain(&self) -> Drain<'_, T> {
        Drain {
            inner: &self.inner,
            remaining: self.inner.len(),
        }
    }

    /// Blocks until an item arrives or `timeout` elapses.
    ///
    /// Returns `None` on timeout, or if every sender is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.inner.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Non-blocking receive of a single item.
    pub fn try_recv(&self) -> Option<T> {
        self.inner.try_recv().ok()
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Iterator returned by [`HandoffReceiver::drain`].
pub struct Drain<'a, T> {
    inner: &'a Receiver<T>,
    remaining: usize,
}

impl<T> Iterator for Drain<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.inner.try_recv().ok()
    }
}
