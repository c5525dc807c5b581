//! Per-process mailbox
//!
//! A FIFO message queue with a hard capacity, pattern-selective reads, and
//! TTL sweeping. All operations go through one internal lock so the
//! dispatch loop and the fault handler can both deliver safely.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;

use reeve_bytecode::Value;

use crate::message::{Acknowledgment, Message};

/// Match a value against a pattern. A null pattern matches anything. A
/// map pattern matches a map value iff every pattern key is present in
/// the value and the pattern's entry is either null (wildcard) or equal.
/// Any other pattern matches by structural equality.
pub fn matches_pattern(value: &Value, pattern: &Value) -> bool {
    match pattern {
        Value::Null => true,
        Value::Map(pattern_map) => match value {
            Value::Map(value_map) => pattern_map.iter().all(|(key, expected)| {
                match (value_map.get(key), expected) {
                    (Some(_), Value::Null) => true,
                    (Some(actual), expected) => actual == expected,
                    (None, _) => false,
                }
            }),
            _ => false,
        },
        _ => value == pattern,
    }
}

#[derive(Debug, Default)]
struct MailboxInner {
    messages: VecDeque<Message>,
    acks: Vec<Acknowledgment>,
}

/// FIFO message queue with capacity, selective reads, and TTL cleanup.
#[derive(Debug)]
pub struct Mailbox {
    inner: Mutex<MailboxInner>,
    capacity: usize,
}

impl Mailbox {
    /// Create a mailbox holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(MailboxInner::default()),
            capacity,
        }
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    /// Whether the mailbox is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().messages.is_empty()
    }

    /// Whether the mailbox is at capacity.
    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        inner.messages.len() >= self.capacity
    }

    /// Append a message. Returns false without inserting if full.
    pub fn push(&self, message: Message) -> bool {
        let mut inner = self.inner.lock();
        if inner.messages.len() >= self.capacity {
            return false;
        }
        inner.messages.push_back(message);
        true
    }

    /// Remove and return the oldest message.
    pub fn shift(&self) -> Option<Message> {
        self.inner.lock().messages.pop_front()
    }

    /// Clone the oldest message without removing it.
    pub fn peek(&self) -> Option<Message> {
        self.inner.lock().messages.front().cloned()
    }

    /// Clone the value of the message at position `i`, if present. Used
    /// by selective receive to scan without holding the lock across
    /// matcher execution.
    pub fn value_at(&self, i: usize) -> Option<Value> {
        self.inner.lock().messages.get(i).map(|m| m.value.clone())
    }

    /// Remove and return the message at position `i`.
    pub fn remove_at(&self, i: usize) -> Option<Message> {
        self.inner.lock().messages.remove(i)
    }

    /// Remove and return the first message whose value matches `pattern`.
    pub fn select(&self, pattern: &Value) -> Option<Message> {
        let mut inner = self.inner.lock();
        let index = inner
            .messages
            .iter()
            .position(|m| matches_pattern(&m.value, pattern))?;
        inner.messages.remove(index)
    }

    /// Drop every message whose TTL has elapsed; returns how many.
    pub fn cleanup_expired(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.messages.len();
        inner.messages.retain(|m| !m.is_expired(now));
        before - inner.messages.len()
    }

    /// Record an acknowledgment for the owning process.
    pub fn push_ack(&self, ack: Acknowledgment) {
        self.inner.lock().acks.push(ack);
    }

    /// Take all pending acknowledgments.
    pub fn take_acks(&self) -> Vec<Acknowledgment> {
        std::mem::take(&mut self.inner.lock().acks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn msg(id: u64, value: Value) -> Message {
        Message {
            id,
            sender: 0,
            value,
            needs_ack: false,
            sent_at: Instant::now(),
            ttl: None,
        }
    }

    #[test]
    fn test_fifo_order() {
        let mb = Mailbox::new(8);
        assert!(mb.push(msg(1, Value::Int(1))));
        assert!(mb.push(msg(2, Value::Int(2))));
        assert_eq!(mb.shift().unwrap().id, 1);
        assert_eq!(mb.shift().unwrap().id, 2);
        assert!(mb.shift().is_none());
    }

    #[test]
    fn test_capacity() {
        let mb = Mailbox::new(2);
        assert!(mb.push(msg(1, Value::Null)));
        assert!(mb.push(msg(2, Value::Null)));
        assert!(!mb.push(msg(3, Value::Null)));
        assert_eq!(mb.len(), 2);
        assert!(mb.is_full());
    }

    #[test]
    fn test_peek_does_not_remove() {
        let mb = Mailbox::new(8);
        mb.push(msg(1, Value::Int(7)));
        assert_eq!(mb.peek().unwrap().value, Value::Int(7));
        assert_eq!(mb.len(), 1);
    }

    #[test]
    fn test_select_by_pattern() {
        let mb = Mailbox::new(8);
        mb.push(msg(1, Value::Int(1)));
        mb.push(msg(2, Value::str("skip")));
        mb.push(msg(3, Value::Int(2)));

        // Exact-value pattern removes the first match only.
        let selected = mb.select(&Value::Int(2)).unwrap();
        assert_eq!(selected.id, 3);
        assert_eq!(mb.len(), 2);

        // No match leaves everything queued.
        assert!(mb.select(&Value::Int(99)).is_none());
        assert_eq!(mb.len(), 2);
    }

    #[test]
    fn test_map_pattern() {
        let value = Value::map([("signal", Value::str("DOWN")), ("ref", Value::Uint(4))]);
        // Key present + equal.
        assert!(matches_pattern(
            &value,
            &Value::map([("signal", Value::str("DOWN"))])
        ));
        // Null pattern entry is a wildcard on a present key.
        assert!(matches_pattern(&value, &Value::map([("ref", Value::Null)])));
        // Missing key fails.
        assert!(!matches_pattern(
            &value,
            &Value::map([("from", Value::Null)])
        ));
        // Null pattern matches anything.
        assert!(matches_pattern(&value, &Value::Null));
        assert!(matches_pattern(&Value::Int(3), &Value::Null));
    }

    #[test]
    fn test_cleanup_expired() {
        let mb = Mailbox::new(8);
        let old = Instant::now() - Duration::from_secs(60);
        mb.push(Message {
            id: 1,
            sender: 0,
            value: Value::Int(1),
            needs_ack: false,
            sent_at: old,
            ttl: Some(Duration::from_secs(30)),
        });
        mb.push(msg(2, Value::Int(2)));
        assert_eq!(mb.cleanup_expired(Instant::now()), 1);
        assert_eq!(mb.len(), 1);
        assert_eq!(mb.shift().unwrap().id, 2);
    }

    #[test]
    fn test_remove_at_preserves_rest() {
        let mb = Mailbox::new(8);
        mb.push(msg(1, Value::Int(1)));
        mb.push(msg(2, Value::str("skip")));
        mb.push(msg(3, Value::Int(2)));
        assert_eq!(mb.remove_at(1).unwrap().id, 2);
        assert_eq!(mb.value_at(0), Some(Value::Int(1)));
        assert_eq!(mb.value_at(1), Some(Value::Int(2)));
    }
}
