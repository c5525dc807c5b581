//! Reduction scheduler
//!
//! Four priority run queues plus three parking areas: a waiting set (no
//! deadline), a deadline-ordered min-heap for timed waits, and a set of
//! processes blocked on sends. A reactivation queue carries processes
//! woken by message delivery back to the dispatch loop.
//!
//! Every live process is in exactly one of these containers (or currently
//! executing a slice); dead processes are in none.

mod timer;

pub use timer::TimerManager;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use reeve_bytecode::Value;

use crate::process::{Addr, Priority, Process, ProcessState, WaitPredicate};

/// Entry in the timed-wait heap, ordered earliest-deadline-first.
struct TimedEntry {
    deadline: Instant,
    proc: Arc<Process>,
}

impl Ord for TimedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse comparison for min-heap
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.proc.addr() == other.proc.addr()
    }
}

impl Eq for TimedEntry {}

#[derive(Default)]
struct SchedInner {
    run: [VecDeque<Addr>; 4],
    run_set: FxHashSet<Addr>,
    waiting: FxHashSet<Addr>,
    timed: BinaryHeap<TimedEntry>,
    timed_set: FxHashSet<Addr>,
    blocked: FxHashSet<Addr>,
    reactivate: VecDeque<Arc<Process>>,
}

impl SchedInner {
    fn push_run(&mut self, addr: Addr, priority: Priority) {
        if self.run_set.insert(addr) {
            self.run[priority.index()].push_back(addr);
        }
    }

    fn unpark(&mut self, addr: Addr) {
        self.waiting.remove(&addr);
        self.timed_set.remove(&addr);
        self.blocked.remove(&addr);
        // Stale heap entries are dropped lazily in check_timeouts.
    }
}

/// Priority run queues and parking areas for all live processes.
#[derive(Default)]
pub struct Scheduler {
    inner: Mutex<SchedInner>,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a process in the container matching its current state.
    pub fn enqueue(&self, proc: &Arc<Process>) {
        let mut inner = self.inner.lock();
        match proc.state() {
            ProcessState::Alive => inner.push_run(proc.addr(), proc.priority()),
            ProcessState::Waiting => {
                let deadline = proc.wait().deadline;
                match deadline {
                    Some(deadline) => {
                        inner.timed_set.insert(proc.addr());
                        inner.timed.push(TimedEntry {
                            deadline,
                            proc: Arc::clone(proc),
                        });
                    }
                    None => {
                        inner.waiting.insert(proc.addr());
                    }
                }
            }
            ProcessState::Blocked => {
                inner.blocked.insert(proc.addr());
            }
            ProcessState::Stale | ProcessState::Dead => {}
        }
    }

    /// Pop the head of the highest non-empty priority queue.
    pub fn next_runnable(&self) -> Option<Addr> {
        let mut inner = self.inner.lock();
        for queue_index in (0..4).rev() {
            if let Some(addr) = inner.run[queue_index].pop_front() {
                inner.run_set.remove(&addr);
                return Some(addr);
            }
        }
        None
    }

    /// Wake a parked process: remove it from every waiting area, clear
    /// its wait bookkeeping, and push it onto its run queue.
    pub fn make_runnable(&self, proc: &Arc<Process>) {
        let mut inner = self.inner.lock();
        inner.unpark(proc.addr());
        proc.wait().clear();
        proc.set_state(ProcessState::Alive);
        inner.push_run(proc.addr(), proc.priority());
    }

    /// Park a process waiting for a message.
    pub fn wait_for_message(
        &self,
        proc: &Arc<Process>,
        predicate: WaitPredicate,
        deadline: Option<Instant>,
        timeout_token: bool,
    ) {
        {
            let mut wait = proc.wait();
            wait.predicate = predicate;
            wait.since = Some(Instant::now());
            wait.deadline = deadline;
            wait.timeout_token = timeout_token;
        }
        proc.set_state(ProcessState::Waiting);
        self.enqueue(proc);
    }

    /// Undo a park made during the current slice without queueing the
    /// process: it is still running on the dispatch thread. Used when an
    /// inline lambda frame refuses to suspend.
    pub fn cancel_park(&self, proc: &Arc<Process>) {
        let mut inner = self.inner.lock();
        inner.unpark(proc.addr());
        proc.wait().clear();
        proc.set_state(ProcessState::Alive);
    }

    /// Park a process blocked on a send.
    pub fn block_on_send(&self, proc: &Arc<Process>) {
        {
            let mut wait = proc.wait();
            wait.since = Some(Instant::now());
        }
        proc.set_state(ProcessState::Blocked);
        self.enqueue(proc);
    }

    /// Wake every timed waiter whose deadline has passed. Waiters parked
    /// by a timed receive get the timeout token: the re-armed receive is
    /// skipped and `(null, false)` is pushed. Plain sleeps just resume.
    /// Returns the woken processes.
    pub fn check_timeouts(&self, now: Instant) -> Vec<Arc<Process>> {
        let mut woken = Vec::new();
        loop {
            let entry = {
                let mut inner = self.inner.lock();
                match inner.timed.peek() {
                    Some(head) if head.deadline <= now => inner.timed.pop(),
                    _ => break,
                }
            };
            let Some(entry) = entry else { break };
            let proc = entry.proc;

            // Lazy invalidation: the process may have been woken (or died)
            // since this entry was pushed.
            let still_parked = proc.state() == ProcessState::Waiting
                && proc.wait().deadline == Some(entry.deadline);
            if !still_parked {
                continue;
            }

            let wants_token = proc.wait().timeout_token;
            self.make_runnable(&proc);
            if wants_token {
                let mut exec = proc.exec();
                exec.ip += 1;
                exec.stack.push(Value::Null);
                exec.stack.push(Value::Bool(false));
            }
            woken.push(proc);
        }
        woken
    }

    /// Addresses currently blocked on sends.
    pub fn blocked_addrs(&self) -> Vec<Addr> {
        self.inner.lock().blocked.iter().copied().collect()
    }

    /// Addresses currently waiting (timed or not).
    pub fn waiting_addrs(&self) -> Vec<Addr> {
        let inner = self.inner.lock();
        inner
            .waiting
            .iter()
            .chain(inner.timed_set.iter())
            .copied()
            .collect()
    }

    /// Queue a woken process for the dispatch loop to drain.
    pub fn reactivate_later(&self, proc: &Arc<Process>) {
        self.inner.lock().reactivate.push_back(Arc::clone(proc));
    }

    /// Drain the reactivation queue.
    pub fn drain_reactivation(&self) -> Vec<Arc<Process>> {
        let mut inner = self.inner.lock();
        inner.reactivate.drain(..).collect()
    }

    /// Remove a process from every queue and set.
    pub fn mark_dead(&self, addr: Addr) {
        let mut inner = self.inner.lock();
        if inner.run_set.remove(&addr) {
            for queue in &mut inner.run {
                queue.retain(|&a| a != addr);
            }
        }
        inner.unpark(addr);
        inner.reactivate.retain(|p| p.addr() != addr);
    }

    /// Re-queue a process at the tail of its priority, if still alive.
    pub fn yield_process(&self, proc: &Arc<Process>) {
        if proc.state() != ProcessState::Alive {
            return;
        }
        self.inner.lock().push_run(proc.addr(), proc.priority());
    }

    /// Whether any process is parked waiting, timed, or blocked, or a
    /// reactivation is pending.
    pub fn has_pending(&self) -> bool {
        let inner = self.inner.lock();
        !inner.waiting.is_empty()
            || !inner.timed_set.is_empty()
            || !inner.blocked.is_empty()
            || !inner.reactivate.is_empty()
    }

    /// Number of processes in run queues.
    pub fn runnable_count(&self) -> usize {
        self.inner.lock().run_set.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reeve_bytecode::{Instruction, Opcode, Program};
    use std::time::Duration;

    fn proc_at(addr: Addr, priority: Priority) -> Arc<Process> {
        let program = Program::new(vec![Instruction::op(Opcode::Nop)]);
        let p = Arc::new(Process::from_program(addr, None, &program, 8));
        p.set_priority(priority);
        p
    }

    #[test]
    fn test_priority_order() {
        let sched = Scheduler::new();
        sched.enqueue(&proc_at(1, Priority::Low));
        sched.enqueue(&proc_at(2, Priority::Max));
        sched.enqueue(&proc_at(3, Priority::Normal));
        sched.enqueue(&proc_at(4, Priority::High));

        assert_eq!(sched.next_runnable(), Some(2));
        assert_eq!(sched.next_runnable(), Some(4));
        assert_eq!(sched.next_runnable(), Some(3));
        assert_eq!(sched.next_runnable(), Some(1));
        assert_eq!(sched.next_runnable(), None);
    }

    #[test]
    fn test_fifo_within_priority() {
        let sched = Scheduler::new();
        sched.enqueue(&proc_at(1, Priority::Normal));
        sched.enqueue(&proc_at(2, Priority::Normal));
        assert_eq!(sched.next_runnable(), Some(1));
        assert_eq!(sched.next_runnable(), Some(2));
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let sched = Scheduler::new();
        let p = proc_at(1, Priority::Normal);
        sched.enqueue(&p);
        sched.enqueue(&p);
        assert_eq!(sched.runnable_count(), 1);
        assert_eq!(sched.next_runnable(), Some(1));
        assert_eq!(sched.next_runnable(), None);
    }

    #[test]
    fn test_wait_and_wake() {
        let sched = Scheduler::new();
        let p = proc_at(1, Priority::Normal);
        sched.wait_for_message(&p, WaitPredicate::Any, None, false);
        assert_eq!(p.state(), ProcessState::Waiting);
        assert_eq!(sched.next_runnable(), None);
        assert!(sched.has_pending());

        sched.make_runnable(&p);
        assert_eq!(p.state(), ProcessState::Alive);
        assert_eq!(sched.next_runnable(), Some(1));
        assert!(!sched.has_pending());
    }

    #[test]
    fn test_timed_wait_expiry_pushes_token() {
        let sched = Scheduler::new();
        let p = proc_at(1, Priority::Normal);
        let deadline = Instant::now() - Duration::from_millis(1);
        sched.wait_for_message(&p, WaitPredicate::Any, Some(deadline), true);

        let woken = sched.check_timeouts(Instant::now());
        assert_eq!(woken.len(), 1);
        assert_eq!(p.state(), ProcessState::Alive);
        let exec = p.exec();
        assert_eq!(exec.ip, 1);
        assert_eq!(
            exec.stack,
            vec![Value::Null, Value::Bool(false)]
        );
    }

    #[test]
    fn test_sleep_expiry_has_no_token() {
        let sched = Scheduler::new();
        let p = proc_at(1, Priority::Normal);
        let deadline = Instant::now() - Duration::from_millis(1);
        sched.wait_for_message(&p, WaitPredicate::Any, Some(deadline), false);

        let woken = sched.check_timeouts(Instant::now());
        assert_eq!(woken.len(), 1);
        let exec = p.exec();
        assert_eq!(exec.ip, 0);
        assert!(exec.stack.is_empty());
    }

    #[test]
    fn test_future_deadline_not_woken() {
        let sched = Scheduler::new();
        let p = proc_at(1, Priority::Normal);
        let deadline = Instant::now() + Duration::from_secs(60);
        sched.wait_for_message(&p, WaitPredicate::Any, Some(deadline), true);
        assert!(sched.check_timeouts(Instant::now()).is_empty());
        assert_eq!(p.state(), ProcessState::Waiting);
    }

    #[test]
    fn test_stale_heap_entry_skipped() {
        let sched = Scheduler::new();
        let p = proc_at(1, Priority::Normal);
        let deadline = Instant::now() - Duration::from_millis(1);
        sched.wait_for_message(&p, WaitPredicate::Any, Some(deadline), true);
        // A message wakes the process before the deadline fires.
        sched.make_runnable(&p);
        assert_eq!(sched.next_runnable(), Some(1));

        // The expired heap entry must not wake (or double-push) anything.
        let woken = sched.check_timeouts(Instant::now());
        assert!(woken.is_empty());
        assert!(p.exec().stack.is_empty());
    }

    #[test]
    fn test_mark_dead_removes_everywhere() {
        let sched = Scheduler::new();
        let p = proc_at(1, Priority::Normal);
        sched.enqueue(&p);
        sched.mark_dead(1);
        assert_eq!(sched.next_runnable(), None);
        assert!(!sched.has_pending());
    }

    #[test]
    fn test_yield_requeues_alive_only() {
        let sched = Scheduler::new();
        let p = proc_at(1, Priority::Normal);
        sched.enqueue(&p);
        assert_eq!(sched.next_runnable(), Some(1));
        sched.yield_process(&p);
        assert_eq!(sched.next_runnable(), Some(1));

        p.set_state(ProcessState::Dead);
        sched.yield_process(&p);
        assert_eq!(sched.next_runnable(), None);
    }
}
