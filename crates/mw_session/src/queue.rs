//! Bounded queue for messages submitted before the session is READY.
//!
//! FIFO with drop-oldest overflow: losing the oldest queued message is
//! by-design data loss, not an error. Each entry carries its own expiry
//! and a deferred send action executed at drain time.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::SessionError;

/// Deferred delivery action, executed once when the queue drains.
pub type SendAction =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<(), SessionError>> + Send>> + Send>;

pub struct QueuedMessage {
    pub id: String,
    pub content: String,
    pub queued_at: Instant,
    pub expires_at: Instant,
    pub action: SendAction,
}

pub struct MessageQueue {
    entries: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Enqueue a message; evicts the oldest entry when full.
    /// Returns the new entry's id and the evicted id, if any.
    pub fn push(
        &mut self,
        content: String,
        expiry: Duration,
        action: SendAction,
    ) -> (String, Option<String>) {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front().map(|dropped| dropped.id)
        } else {
            None
        };
        let id = Uuid::new_v4().to_string();
        let now = Instant::now();
        self.entries.push_back(QueuedMessage {
            id: id.clone(),
            content,
            queued_at: now,
            expires_at: now + expiry,
            action,
        });
        (id, evicted)
    }

    /// Next entry in FIFO order.
    pub fn pop(&mut self) -> Option<QueuedMessage> {
        self.entries.pop_front()
    }

    /// Silently drop entries whose expiry has passed. Returns the count.
    pub fn prune_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    fn contents(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.content.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_action() -> SendAction {
        Box::new(|| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn overflow_keeps_the_newest_in_fifo_order() {
        let mut queue = MessageQueue::new(50);
        let mut evictions = 0;
        for i in 0..60 {
            let (_, evicted) = queue.push(
                format!("msg-{i}"),
                Duration::from_secs(30),
                noop_action(),
            );
            if evicted.is_some() {
                evictions += 1;
            }
        }
        assert_eq!(queue.len(), 50);
        assert_eq!(evictions, 10);
        // Exactly the 50 most recent, oldest first.
        let expected: Vec<String> = (10..60).map(|i| format!("msg-{i}")).collect();
        assert_eq!(queue.contents(), expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn pop_is_fifo() {
        let mut queue = MessageQueue::new(10);
        queue.push("first".into(), Duration::from_secs(30), noop_action());
        queue.push("second".into(), Duration::from_secs(30), noop_action());
        assert_eq!(queue.pop().unwrap().content, "first");
        assert_eq!(queue.pop().unwrap().content, "second");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn prune_drops_only_expired_entries() {
        let mut queue = MessageQueue::new(10);
        queue.push("stale".into(), Duration::from_millis(0), noop_action());
        queue.push("live".into(), Duration::from_secs(30), noop_action());
        let dropped = queue.prune_expired(Instant::now() + Duration::from_millis(1));
        assert_eq!(dropped, 1);
        assert_eq!(queue.contents(), vec!["live"]);
    }
}
