//! Multicast streams for watch keys and errors.
//!
//! Both streams are plain broadcast channels: every subscriber gets its own
//! cursor, nothing is replayed to late subscribers, and sending with no
//! subscribers attached is not an error.

use std::fmt::Debug;

use tokio::sync::broadcast;

/// Default capacity of each stream before slow subscribers start lagging.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out publisher shared by the dispatcher and every watch key.
///
/// Sends never block; a subscriber more than `capacity` items behind lags.
#[derive(Debug)]
pub struct Broadcaster<T> {
    sender: broadcast::Sender<T>,
    name: &'static str,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            name: self.name,
        }
    }
}

impl<T: Clone + Debug> Broadcaster<T> {
    /// Create a new broadcaster with specified channel capacity.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, name }
    }

    /// Publish an item to all current subscribers.
    pub fn send(&self, item: T) {
        match self.sender.send(item) {
            Ok(count) => {
                crate::debug_event!(self.name, "sent", "to {count} subscribers");
            }
            Err(broadcast::error::SendError(item)) => {
                crate::debug_event!(self.name, "dropped", "no subscribers for {item:?}");
            }
        }
    }

    /// Subscribe to items published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }
}
