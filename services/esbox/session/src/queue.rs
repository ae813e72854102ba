//! Outbound message queue.
//!
//! Entries pop in FIFO order across both admission modes. A `Single` entry
//! is unique per identity key while pending: enqueuing the same key again
//! replaces the payload in place. Once popped, the key is free again.

use esbox_wire::{Message, QueueMode};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// One pending outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEntry {
    /// Payload
    pub message: Message,
    /// Admission mode it was queued with
    pub mode: QueueMode,
    /// Deduplication key for `Single` entries
    pub key: String,
}

/// Per-session outbound queue
#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: VecDeque<QueuedEntry>,
    /// Sequence number of `entries[0]`
    head_seq: u64,
    /// Pending `Single` key -> sequence number
    singles: HashMap<String, u64>,
}

impl OutboundQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message. Returns `true` if it replaced a pending entry.
    pub fn enqueue(&mut self, message: Message, mode: QueueMode, key: impl Into<String>) -> bool {
        let key = key.into();
        if mode == QueueMode::Single {
            if let Some(&seq) = self.singles.get(&key) {
                let index = (seq - self.head_seq) as usize;
                if let Some(entry) = self.entries.get_mut(index) {
                    debug!("Queue replaced pending {} entry", key);
                    entry.message = message;
                    return true;
                }
            }
            self.singles
                .insert(key.clone(), self.head_seq + self.entries.len() as u64);
        }
        self.entries.push_back(QueuedEntry { message, mode, key });
        false
    }

    /// Queue a message with its id's default mode, keyed by its wire id
    pub fn push(&mut self, message: Message) -> bool {
        let mode = message.id.default_queue_mode();
        let key = message.id.as_str();
        self.enqueue(message, mode, key)
    }

    /// Pop the oldest entry
    pub fn pop_next(&mut self) -> Option<QueuedEntry> {
        let entry = self.entries.pop_front()?;
        if entry.mode == QueueMode::Single && self.singles.get(&entry.key) == Some(&self.head_seq) {
            self.singles.remove(&entry.key);
        }
        self.head_seq += 1;
        Some(entry)
    }

    /// Put popped entries back at the head, oldest first
    pub fn restore(&mut self, entries: Vec<QueuedEntry>) {
        for entry in entries.into_iter().rev() {
            self.head_seq = self.head_seq.saturating_sub(1);
            if entry.mode == QueueMode::Single {
                self.singles.entry(entry.key.clone()).or_insert(self.head_seq);
            }
            self.entries.push_front(entry);
        }
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discard everything
    pub fn clear(&mut self) {
        self.head_seq += self.entries.len() as u64;
        self.entries.clear();
        self.singles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use esbox_wire::{MessageBody, ProtocolVersion};

    fn token(token: &str) -> Message {
        Message::for_version(
            ProtocolVersion::V1_0,
            MessageBody::SendUpdateToken {
                token: token.to_string(),
            },
        )
        .unwrap()
    }

    fn body_token(entry: &QueuedEntry) -> &str {
        match &entry.message.body {
            MessageBody::SendUpdateToken { token } => token,
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_single_replaces_pending() {
        let mut q = OutboundQueue::new();
        assert!(!q.enqueue(token("A"), QueueMode::Single, "K"));
        assert!(q.enqueue(token("B"), QueueMode::Single, "K"));
        assert_eq!(q.len(), 1);

        let entry = q.pop_next().unwrap();
        assert_eq!(body_token(&entry), "B");
        assert!(q.pop_next().is_none());
    }

    #[test]
    fn test_normal_preserves_order_and_count() {
        let mut q = OutboundQueue::new();
        for t in ["A", "B", "A", "C"] {
            q.enqueue(token(t), QueueMode::Normal, "K");
        }
        let popped: Vec<String> = std::iter::from_fn(|| q.pop_next())
            .map(|e| body_token(&e).to_string())
            .collect();
        assert_eq!(popped, vec!["A", "B", "A", "C"]);
    }

    #[test]
    fn test_replacement_keeps_position() {
        let mut q = OutboundQueue::new();
        q.enqueue(token("first"), QueueMode::Single, "K");
        q.enqueue(token("other"), QueueMode::Normal, "N");
        q.enqueue(token("second"), QueueMode::Single, "K");

        assert_eq!(body_token(&q.pop_next().unwrap()), "second");
        assert_eq!(body_token(&q.pop_next().unwrap()), "other");
    }

    #[test]
    fn test_popped_key_starts_fresh_entry() {
        let mut q = OutboundQueue::new();
        q.enqueue(token("A"), QueueMode::Single, "K");
        q.enqueue(token("x"), QueueMode::Normal, "N");
        assert_eq!(body_token(&q.pop_next().unwrap()), "A");

        assert!(!q.enqueue(token("B"), QueueMode::Single, "K"));
        assert!(q.enqueue(token("C"), QueueMode::Single, "K"));
        assert_eq!(body_token(&q.pop_next().unwrap()), "x");
        assert_eq!(body_token(&q.pop_next().unwrap()), "C");
        assert!(q.is_empty());
    }

    #[test]
    fn test_push_uses_default_mode() {
        let mut q = OutboundQueue::new();
        let report = |device: &str| {
            Message::for_version(
                ProtocolVersion::V1_1,
                MessageBody::DispatchReport {
                    device: device.to_string(),
                },
            )
            .unwrap()
        };
        q.push(report("A"));
        q.push(report("A"));
        q.push(token("T1"));
        q.push(token("T2"));
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop_next().unwrap().mode, QueueMode::Normal);
    }

    #[test]
    fn test_restore_returns_entries_to_head() {
        let mut q = OutboundQueue::new();
        q.enqueue(token("A"), QueueMode::Single, "K");
        q.enqueue(token("B"), QueueMode::Normal, "N");
        q.enqueue(token("C"), QueueMode::Normal, "N");
        let popped = vec![q.pop_next().unwrap(), q.pop_next().unwrap()];

        q.restore(popped);
        assert_eq!(q.len(), 3);
        assert!(q.enqueue(token("A2"), QueueMode::Single, "K"));
        let order: Vec<String> = std::iter::from_fn(|| q.pop_next())
            .map(|e| body_token(&e).to_string())
            .collect();
        assert_eq!(order, vec!["A2", "B", "C"]);
    }

    #[test]
    fn test_clear() {
        let mut q = OutboundQueue::new();
        q.enqueue(token("A"), QueueMode::Single, "K");
        q.clear();
        assert!(q.is_empty());
        assert!(!q.enqueue(token("B"), QueueMode::Single, "K"));
        assert_eq!(body_token(&q.pop_next().unwrap()), "B");
    }
}
