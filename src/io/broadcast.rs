//! Per-session subscriber fan-out
//!
//! Each subscriber gets its own bounded mpsc channel. Delivery is
//! fire-and-forget via `try_send`: a subscriber whose channel is full or
//! closed is dropped from the set and never blocks the producer or the
//! other subscribers.

use tokio::sync::mpsc;
use tracing::debug;

/// Identifies one subscription within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Subscriber registry with non-blocking fan-out
pub struct Broadcaster<T> {
    next_id: u64,
    subscribers: Vec<(SubscriberId, mpsc::Sender<T>)>,
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Self {
        Self { next_id: 0, subscribers: Vec::new() }
    }

    /// Add a subscriber with its own bounded channel
    pub fn subscribe(&mut self, buffer: usize) -> (SubscriberId, mpsc::Receiver<T>) {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.subscribers.push((id, tx));
        (id, rx)
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Deliver to every subscriber without blocking. Subscribers that are
    /// full or closed are silently dropped; returns how many were.
    pub fn broadcast(&mut self, message: T) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|(id, tx)| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(subscriber = id.0, "subscriber_dropped_full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = id.0, "subscriber_dropped_closed");
                false
            }
        });
        before - self.subscribers.len()
    }

    /// Drop every subscriber, closing their channels
    pub fn clear(&mut self) {
        self.subscribers.clear();
    }
}

impl<T: Clone> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}
