//! Link and monitor registry
//!
//! Four tables under one lock: the symmetric link sets, the forward
//! monitor index (watcher → refs), the reverse index (watched → refs),
//! and the trap-exit set. `cleanup` removes a dead process from all four
//! and hands the fault handler what it needs to fan out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use reeve_bytecode::MonitorRef;

use crate::process::Addr;

#[derive(Debug, Default)]
struct LinkInner {
    links: FxHashMap<Addr, FxHashSet<Addr>>,
    monitors: FxHashMap<Addr, Vec<MonitorRef>>,
    watched_by: FxHashMap<Addr, Vec<MonitorRef>>,
    trapping: FxHashSet<Addr>,
}

/// Bidirectional links, unidirectional monitors, and trap-exit flags.
#[derive(Debug, Default)]
pub struct LinkRegistry {
    inner: Mutex<LinkInner>,
    next_ref: AtomicU64,
}

impl LinkRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LinkInner::default()),
            next_ref: AtomicU64::new(1),
        }
    }

    /// Link two processes. Links are symmetric; self-links are a no-op.
    pub fn link(&self, a: Addr, b: Addr) {
        if a == b {
            return;
        }
        let mut inner = self.inner.lock();
        inner.links.entry(a).or_default().insert(b);
        inner.links.entry(b).or_default().insert(a);
    }

    /// Remove a link in both directions.
    pub fn unlink(&self, a: Addr, b: Addr) {
        let mut inner = self.inner.lock();
        if let Some(set) = inner.links.get_mut(&a) {
            set.remove(&b);
        }
        if let Some(set) = inner.links.get_mut(&b) {
            set.remove(&a);
        }
    }

    /// Whether two processes are linked.
    pub fn is_linked(&self, a: Addr, b: Addr) -> bool {
        self.inner
            .lock()
            .links
            .get(&a)
            .map(|set| set.contains(&b))
            .unwrap_or(false)
    }

    /// All processes linked to `addr`.
    pub fn links_of(&self, addr: Addr) -> Vec<Addr> {
        self.inner
            .lock()
            .links
            .get(&addr)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Create a monitor from `watcher` on `watched`, minting a fresh
    /// reference recorded in both indices.
    pub fn monitor(&self, watcher: Addr, watched: Addr) -> MonitorRef {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let reference = MonitorRef {
            id: self.next_ref.fetch_add(1, Ordering::Relaxed),
            watcher,
            watched,
            created_at,
        };
        let mut inner = self.inner.lock();
        inner.monitors.entry(watcher).or_default().push(reference);
        inner.watched_by.entry(watched).or_default().push(reference);
        reference
    }

    /// Remove a monitor by reference id. Returns false if unknown.
    pub fn demonitor(&self, reference_id: u64) -> bool {
        let mut inner = self.inner.lock();
        let mut found = false;
        for refs in inner.monitors.values_mut() {
            let before = refs.len();
            refs.retain(|r| r.id != reference_id);
            found |= refs.len() != before;
        }
        for refs in inner.watched_by.values_mut() {
            refs.retain(|r| r.id != reference_id);
        }
        found
    }

    /// All monitors held by `watcher`.
    pub fn monitors_of(&self, watcher: Addr) -> Vec<MonitorRef> {
        self.inner
            .lock()
            .monitors
            .get(&watcher)
            .cloned()
            .unwrap_or_default()
    }

    /// Set or clear the trap-exit flag.
    pub fn set_trap_exit(&self, addr: Addr, trapping: bool) {
        let mut inner = self.inner.lock();
        if trapping {
            inner.trapping.insert(addr);
        } else {
            inner.trapping.remove(&addr);
        }
    }

    /// Whether `addr` traps exit signals.
    pub fn traps_exit(&self, addr: Addr) -> bool {
        self.inner.lock().trapping.contains(&addr)
    }

    /// Remove a dead process from every table. Returns its linked
    /// addresses and the monitor refs pointing at it (so the fault
    /// handler can deliver DOWN messages to their watchers).
    pub fn cleanup(&self, addr: Addr) -> (Vec<Addr>, Vec<MonitorRef>) {
        let mut inner = self.inner.lock();

        let linked: Vec<Addr> = inner
            .links
            .remove(&addr)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for other in &linked {
            if let Some(set) = inner.links.get_mut(other) {
                set.remove(&addr);
            }
        }

        // Monitors held by the dead process disappear silently.
        let held = inner.monitors.remove(&addr).unwrap_or_default();
        for r in &held {
            if let Some(refs) = inner.watched_by.get_mut(&r.watched) {
                refs.retain(|w| w.id != r.id);
            }
        }

        // Monitors pointing at the dead process trigger DOWN delivery.
        let watchers = inner.watched_by.remove(&addr).unwrap_or_default();
        for r in &watchers {
            if let Some(refs) = inner.monitors.get_mut(&r.watcher) {
                refs.retain(|w| w.id != r.id);
            }
        }

        inner.trapping.remove(&addr);
        (linked, watchers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_links_are_symmetric() {
        let registry = LinkRegistry::new();
        registry.link(1, 2);
        assert!(registry.is_linked(1, 2));
        assert!(registry.is_linked(2, 1));
        assert_eq!(registry.links_of(1), vec![2]);

        registry.unlink(2, 1);
        assert!(!registry.is_linked(1, 2));
        assert!(!registry.is_linked(2, 1));
    }

    #[test]
    fn test_self_link_is_noop() {
        let registry = LinkRegistry::new();
        registry.link(1, 1);
        assert!(!registry.is_linked(1, 1));
        assert!(registry.links_of(1).is_empty());
    }

    #[test]
    fn test_monitor_indices() {
        let registry = LinkRegistry::new();
        let r = registry.monitor(1, 2);
        assert_eq!(r.watcher, 1);
        assert_eq!(r.watched, 2);
        let held = registry.monitors_of(1);
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].id, r.id);
    }

    #[test]
    fn test_demonitor() {
        let registry = LinkRegistry::new();
        let r = registry.monitor(1, 2);
        assert!(registry.demonitor(r.id));
        assert!(!registry.demonitor(r.id));
        assert!(registry.monitors_of(1).is_empty());
        // A later death of 2 produces no watcher refs.
        let (_, watchers) = registry.cleanup(2);
        assert!(watchers.is_empty());
    }

    #[test]
    fn test_trap_exit() {
        let registry = LinkRegistry::new();
        assert!(!registry.traps_exit(1));
        registry.set_trap_exit(1, true);
        assert!(registry.traps_exit(1));
        registry.set_trap_exit(1, false);
        assert!(!registry.traps_exit(1));
    }

    #[test]
    fn test_cleanup_returns_fan_out_sets() {
        let registry = LinkRegistry::new();
        registry.link(1, 2);
        registry.link(1, 3);
        let watcher_ref = registry.monitor(4, 1);
        registry.monitor(1, 5); // held by the dying process, dropped silently
        registry.set_trap_exit(1, true);

        let (mut linked, watchers) = registry.cleanup(1);
        linked.sort_unstable();
        assert_eq!(linked, vec![2, 3]);
        assert_eq!(watchers.len(), 1);
        assert_eq!(watchers[0].id, watcher_ref.id);

        // Everything about 1 is gone.
        assert!(!registry.is_linked(2, 1));
        assert!(!registry.traps_exit(1));
        assert!(registry.monitors_of(1).is_empty());
        // The monitor on 5 held by 1 no longer fires.
        let (_, watchers_of_5) = registry.cleanup(5);
        assert!(watchers_of_5.is_empty());
    }
}
