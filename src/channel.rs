//! Named, identity-bearing wrapper around a [`BoundedQueue`] — the stable
//! handle the graph connects nodes with.

use crate::message::Message;
use crate::queue::BoundedQueue;
use rand::RngCore;

/// Default channel capacity, chosen to absorb a burst without the producer
/// blocking under normal load while still bounding memory.
pub const DEFAULT_CAPACITY: usize = 256;

pub struct Channel {
    name: String,
    id: String,
    queue: BoundedQueue<Message>,
}

impl Channel {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Channel {
            name: name.into(),
            id: random_id(),
            queue: BoundedQueue::new(capacity),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn enqueue_wait(&self, msg: Message) -> bool {
        self.queue.enqueue_wait(msg)
    }

    pub fn dequeue_wait(&self) -> Option<Message> {
        self.queue.dequeue_wait()
    }

    pub fn try_enqueue(&self, msg: Message) -> bool {
        self.queue.try_enqueue(msg)
    }

    pub fn try_dequeue(&self) -> Option<Message> {
        self.queue.try_dequeue()
    }

    pub fn break_all_wait(&self) {
        self.queue.break_all_wait();
    }

    pub fn size(&self) -> usize {
        self.queue.size()
    }

    pub fn empty(&self) -> bool {
        self.queue.empty()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("size", &self.size())
            .finish()
    }
}

/// A random 16-character hex id — the channel's identity, distinct from its
/// (possibly duplicated) name.
fn random_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_by_id_not_name() {
        let a = Channel::new("dup", 4);
        let b = Channel::new("dup", 4);
        assert_eq!(a.name(), b.name());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().len(), 16);
    }
}
