//! Crash dumps
//!
//! When a process dies from an unhandled exception, a snapshot of its
//! state is appended to a bounded store; the oldest dump is discarded
//! when the store is full.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use reeve_bytecode::Value;

use crate::process::Addr;

/// How many values off the top of the data stack a dump keeps.
const STACK_SLICE: usize = 16;

/// Snapshot of a crashed process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashDump {
    /// The dead process.
    pub addr: Addr,
    /// Its registered name, if any.
    pub registered_name: Option<String>,
    /// The exit reason as a value (usually a structured exception map).
    pub reason: Value,
    /// Instruction pointer at death.
    pub ip: usize,
    /// Call stack depth at death.
    pub call_depth: usize,
    /// Top of the data stack, newest first.
    pub stack_top: Vec<Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl CrashDump {
    /// Build a dump, truncating the stack slice and stamping the time.
    pub fn new(
        addr: Addr,
        registered_name: Option<String>,
        reason: Value,
        ip: usize,
        call_depth: usize,
        stack: &[Value],
    ) -> Self {
        let stack_top = stack.iter().rev().take(STACK_SLICE).cloned().collect();
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            addr,
            registered_name,
            reason,
            ip,
            call_depth,
            stack_top,
            timestamp_ms,
        }
    }
}

/// Bounded store of crash dumps, oldest-first eviction.
#[derive(Debug)]
pub struct CrashStore {
    dumps: Mutex<VecDeque<CrashDump>>,
    capacity: usize,
}

impl CrashStore {
    /// Create a store holding at most `capacity` dumps.
    pub fn new(capacity: usize) -> Self {
        Self {
            dumps: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Append a dump, evicting the oldest when full.
    pub fn record(&self, dump: CrashDump) {
        let mut dumps = self.dumps.lock();
        if dumps.len() >= self.capacity {
            dumps.pop_front();
        }
        dumps.push_back(dump);
    }

    /// Number of stored dumps.
    pub fn len(&self) -> usize {
        self.dumps.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.dumps.lock().is_empty()
    }

    /// Take every stored dump, oldest first.
    pub fn take_all(&self) -> Vec<CrashDump> {
        self.dumps.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump(addr: Addr) -> CrashDump {
        CrashDump::new(addr, None, Value::symbol("boom"), 3, 0, &[Value::Int(1)])
    }

    #[test]
    fn test_bounded_eviction() {
        let store = CrashStore::new(2);
        store.record(dump(1));
        store.record(dump(2));
        store.record(dump(3));
        assert_eq!(store.len(), 2);
        let dumps = store.take_all();
        assert_eq!(dumps[0].addr, 2);
        assert_eq!(dumps[1].addr, 3);
        assert!(store.is_empty());
    }

    #[test]
    fn test_stack_slice_is_newest_first() {
        let stack: Vec<Value> = (0..32).map(Value::Int).collect();
        let d = CrashDump::new(1, None, Value::Null, 0, 0, &stack);
        assert_eq!(d.stack_top.len(), 16);
        assert_eq!(d.stack_top[0], Value::Int(31));
    }
}
