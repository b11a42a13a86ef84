//! Source dispatch - one serial stream, many subscribers
//!
//! `Dispatch::publish` hands each chunk to every registered subscriber
//! synchronously, on the caller's thread, in registration order. It is a
//! push source, not a queue: a subscriber that is not ready simply drops the
//! chunk. Subscribers must return quickly and never block.

use std::sync::{Arc, RwLock};

/// Receiver of serial chunks
pub trait Subscriber: Send + Sync {
    /// Called once per published chunk. Must not block.
    fn on_data(&self, chunk: &[u8]);
}

/// Multi-subscriber push source
#[derive(Default)]
pub struct Dispatch {
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
}

impl Dispatch {
    pub fn new() -> Self {
        Dispatch {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a subscriber for all future chunks
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        match self.subscribers.write() {
            Ok(mut subs) => subs.push(subscriber),
            Err(poisoned) => poisoned.into_inner().push(subscriber),
        }
    }

    /// Remove every subscriber (used on shutdown)
    pub fn clear(&self) {
        match self.subscribers.write() {
            Ok(mut subs) => subs.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    /// Deliver `chunk` to every subscriber
    pub fn publish(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let subs = match self.subscribers.read() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        for sub in subs.iter() {
            sub.on_data(chunk);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.read() {
            Ok(subs) => subs.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
