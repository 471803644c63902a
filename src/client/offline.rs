//! Offline publish queue.
//!
//! When auto-reconnect is enabled, publishes issued while the client is
//! not connected are deferred here and flushed in FIFO order once a
//! connection is (re)established.

use crate::codec::packet::Qos;
use crate::codec::properties::Properties;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::warn;

/// A deferred publish. Properties are deep-copied at enqueue time so the
/// caller's container can never observe later mutation.
#[derive(Debug, Clone)]
pub struct QueuedPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
    pub properties: Properties,
}

/// Bounded FIFO with a drop-oldest overflow policy.
///
/// Capacity 0 means unlimited. `len` is an informational snapshot that
/// may race with concurrent producers.
#[derive(Debug)]
pub struct OfflineQueue {
    entries: Mutex<VecDeque<QueuedPublish>>,
    capacity: usize,
}

impl OfflineQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Append an entry, dropping the oldest one first when the queue is
    /// at capacity.
    pub fn push(&self, entry: QueuedPublish) {
        let mut entries = self.entries.lock();
        if self.capacity > 0 && entries.len() == self.capacity {
            if let Some(dropped) = entries.pop_front() {
                warn!(
                    topic = %dropped.topic,
                    capacity = self.capacity,
                    "offline queue full, dropping oldest publish"
                );
            }
        }
        entries.push_back(entry);
    }

    pub fn pop_front(&self) -> Option<QueuedPublish> {
        self.entries.lock().pop_front()
    }

    /// Put an entry back at the head after a failed flush.
    pub fn push_front(&self, entry: QueuedPublish) {
        self.entries.lock().push_front(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(topic: &str) -> QueuedPublish {
        QueuedPublish {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"payload"),
            qos: Qos::AtMostOnce,
            retain: false,
            properties: Properties::default(),
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = OfflineQueue::new(0);
        queue.push(entry("a"));
        queue.push(entry("b"));
        queue.push(entry("c"));
        assert_eq!(queue.pop_front().unwrap().topic, "a");
        assert_eq!(queue.pop_front().unwrap().topic, "b");
        assert_eq!(queue.pop_front().unwrap().topic, "c");
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn test_drop_oldest_at_capacity() {
        let queue = OfflineQueue::new(2);
        queue.push(entry("a"));
        queue.push(entry("b"));
        queue.push(entry("c"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front().unwrap().topic, "b");
        assert_eq!(queue.pop_front().unwrap().topic, "c");
    }

    #[test]
    fn test_zero_capacity_is_unlimited() {
        let queue = OfflineQueue::new(0);
        for i in 0..1000 {
            queue.push(entry(&format!("t/{i}")));
        }
        assert_eq!(queue.len(), 1000);
        assert_eq!(queue.pop_front().unwrap().topic, "t/0");
    }

    #[test]
    fn test_push_front_reinserts_at_head() {
        let queue = OfflineQueue::new(0);
        queue.push(entry("a"));
        queue.push(entry("b"));
        let first = queue.pop_front().unwrap();
        queue.push_front(first);
        assert_eq!(queue.pop_front().unwrap().topic, "a");
    }
}
