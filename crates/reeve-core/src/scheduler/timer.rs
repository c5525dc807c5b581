//! Delayed-message timers
//!
//! A single deadline-ordered min-heap keyed by timer reference. SEND_AFTER
//! schedules an entry; CANCEL_TIMER marks it cancelled (false once it has
//! already fired); the engine drains due entries at the top of every
//! iteration and delivers them like ordinary sends.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::message::Message;
use crate::process::Addr;

struct TimerEntry {
    fire_at: Instant,
    id: u64,
    target: Addr,
    message: Message,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse comparison for min-heap
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TimerEntry {}

#[derive(Default)]
struct TimerInner {
    heap: BinaryHeap<TimerEntry>,
    pending: FxHashSet<u64>,
    cancelled: FxHashSet<u64>,
}

/// Deadline-ordered set of pending delayed messages.
#[derive(Default)]
pub struct TimerManager {
    inner: Mutex<TimerInner>,
}

impl TimerManager {
    /// Create an empty timer manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a message to fire at `fire_at`, keyed by `id`.
    pub fn schedule(&self, id: u64, fire_at: Instant, target: Addr, message: Message) {
        let mut inner = self.inner.lock();
        inner.pending.insert(id);
        inner.heap.push(TimerEntry {
            fire_at,
            id,
            target,
            message,
        });
    }

    /// Cancel a timer. Returns false if it already fired or is unknown.
    pub fn cancel(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.pending.remove(&id) {
            inner.cancelled.insert(id);
            true
        } else {
            false
        }
    }

    /// Pop every timer due at `now`, skipping cancelled entries.
    pub fn due(&self, now: Instant) -> Vec<(Addr, Message)> {
        let mut fired = Vec::new();
        let mut inner = self.inner.lock();
        while let Some(head) = inner.heap.peek() {
            if head.fire_at > now {
                break;
            }
            let entry = inner.heap.pop().expect("peeked entry");
            if inner.cancelled.remove(&entry.id) {
                continue;
            }
            inner.pending.remove(&entry.id);
            fired.push((entry.target, entry.message));
        }
        fired
    }

    /// Number of timers not yet fired or cancelled.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
