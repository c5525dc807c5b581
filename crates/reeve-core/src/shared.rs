//! Shared VM state
//!
//! Everything both the dispatch loop and the fault-handler thread touch:
//! the process table, scheduler, timers, registries, crash store, counters,
//! and the message-delivery protocol (deliver → wake → reactivate).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use reeve_bytecode::{Lambda, Program, Value};

use crate::config::VmConfig;
use crate::dump::CrashStore;
use crate::links::LinkRegistry;
use crate::message::{AckStatus, Acknowledgment, Message};
use crate::process::{Addr, Priority, Process, ProcessState};
use crate::registry::ProcessRegistry;
use crate::scheduler::{Scheduler, TimerManager};
use crate::supervisor::SupervisorRegistry;
use crate::{VmError, VmResult};

/// How many crash dumps the bounded store keeps.
const CRASH_STORE_CAPACITY: usize = 64;

/// Monotonic engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Messages handed to SEND / SEND_AFTER.
    pub sent: AtomicU64,
    /// Messages that landed in a mailbox.
    pub delivered: AtomicU64,
    /// Messages dropped (dead target, drop policy, abandoned sends).
    pub dropped: AtomicU64,
    /// Messages swept by TTL expiry.
    pub expired: AtomicU64,
    /// Exit signals converted into mailbox messages.
    pub trapped_exits: AtomicU64,
    /// Wait-for cycles found by the deadlock scan.
    pub deadlocks_detected: AtomicU64,
    /// Event-loop iterations executed.
    pub iterations: AtomicU64,
    /// Reduction slices executed.
    pub context_switches: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Messages handed to SEND / SEND_AFTER.
    pub sent: u64,
    /// Messages that landed in a mailbox.
    pub delivered: u64,
    /// Messages dropped.
    pub dropped: u64,
    /// Messages swept by TTL expiry.
    pub expired: u64,
    /// Exit signals converted into mailbox messages.
    pub trapped_exits: u64,
    /// Wait-for cycles found by the deadlock scan.
    pub deadlocks_detected: u64,
    /// Event-loop iterations executed.
    pub iterations: u64,
    /// Reduction slices executed.
    pub context_switches: u64,
}

impl EngineStats {
    /// Snapshot all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            trapped_exits: self.trapped_exits.load(Ordering::Relaxed),
            deadlocks_detected: self.deadlocks_detected.load(Ordering::Relaxed),
            iterations: self.iterations.load(Ordering::Relaxed),
            context_switches: self.context_switches.load(Ordering::Relaxed),
        }
    }

    /// Bump a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What happened to an attempted delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverOutcome {
    /// The message is in the target mailbox.
    Delivered,
    /// The target mailbox is full.
    Full,
    /// The target is dead; the message was dropped.
    Dead,
}

/// State shared between the dispatch loop and the fault handler.
pub struct VmShared {
    /// Engine configuration.
    pub config: VmConfig,
    /// Run queues and parking areas.
    pub scheduler: Scheduler,
    /// Delayed-message timers.
    pub timers: TimerManager,
    /// Name → address registry.
    pub names: ProcessRegistry,
    /// Links, monitors, trap-exit flags.
    pub links: LinkRegistry,
    /// Supervision trees.
    pub supervisors: SupervisorRegistry,
    /// Bounded crash-dump store.
    pub crash_store: CrashStore,
    /// Monotonic counters.
    pub stats: EngineStats,

    processes: RwLock<FxHashMap<Addr, Arc<Process>>>,
    next_addr: AtomicU64,
    next_message_id: AtomicU64,
    next_timer_id: AtomicU64,
}

impl VmShared {
    /// Create shared state for one engine.
    pub fn new(config: VmConfig) -> Self {
        Self {
            config,
            scheduler: Scheduler::new(),
            timers: TimerManager::new(),
            names: ProcessRegistry::new(),
            links: LinkRegistry::new(),
            supervisors: SupervisorRegistry::new(),
            crash_store: CrashStore::new(CRASH_STORE_CAPACITY),
            stats: EngineStats::default(),
            processes: RwLock::new(FxHashMap::default()),
            next_addr: AtomicU64::new(1),
            next_message_id: AtomicU64::new(1),
            next_timer_id: AtomicU64::new(1),
        }
    }

    /// Mint a timer reference.
    pub fn next_timer_id(&self) -> u64 {
        self.next_timer_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a process by address.
    pub fn get(&self, addr: Addr) -> Option<Arc<Process>> {
        self.processes.read().get(&addr).cloned()
    }

    /// Whether the address names a live process.
    pub fn is_alive(&self, addr: Addr) -> bool {
        self.get(addr).map(|p| p.is_alive()).unwrap_or(false)
    }

    /// All processes, in no particular order.
    pub fn all_processes(&self) -> Vec<Arc<Process>> {
        self.processes.read().values().cloned().collect()
    }

    /// Number of live processes.
    pub fn live_count(&self) -> usize {
        self.processes.read().values().filter(|p| p.is_alive()).count()
    }

    /// Create a process from a program without enqueueing it. The caller
    /// links/monitors as needed, then hands it to the scheduler.
    pub fn spawn_program(
        &self,
        program: &Program,
        parent: Option<Addr>,
        priority: Priority,
    ) -> VmResult<Arc<Process>> {
        let mut table = self.processes.write();
        let live = table.values().filter(|p| p.is_alive()).count();
        if live >= self.config.max_processes {
            return Err(VmError::Runtime(format!(
                "process limit reached ({})",
                self.config.max_processes
            )));
        }
        let addr = self.next_addr.fetch_add(1, Ordering::Relaxed);
        let proc = Arc::new(Process::from_program(
            addr,
            parent,
            program,
            self.config.max_mailbox_size,
        ));
        proc.set_priority(priority);
        table.insert(addr, Arc::clone(&proc));
        Ok(proc)
    }

    /// Drop a dead process from the table (embedder cleanup).
    pub fn remove(&self, addr: Addr) -> Option<Arc<Process>> {
        self.processes.write().remove(&addr)
    }

    /// Resolve a target value: an integer address, or a registered name
    /// given as string or symbol.
    pub fn resolve_target(&self, value: &Value) -> Option<Addr> {
        if let Some(addr) = value.as_address() {
            return Some(addr);
        }
        value.as_name().and_then(|name| self.names.whereis(name))
    }

    /// Build a message with a fresh id and the default TTL.
    pub fn make_message(&self, sender: Addr, value: Value, needs_ack: bool) -> Message {
        Message {
            id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            sender,
            value,
            needs_ack,
            sent_at: Instant::now(),
            ttl: Some(self.config.default_message_ttl),
        }
    }

    /// Attempt to put a message in a target's mailbox, waking the target
    /// through the reactivation queue when its wait predicate accepts the
    /// new value.
    pub fn try_deliver(&self, target: &Arc<Process>, message: Message) -> DeliverOutcome {
        if !target.is_alive() {
            EngineStats::bump(&self.stats.dropped);
            return DeliverOutcome::Dead;
        }
        let value = message.value.clone();
        let needs_ack = message.needs_ack;
        let (id, sender) = (message.id, message.sender);
        if !target.mailbox().push(message) {
            return DeliverOutcome::Full;
        }
        EngineStats::bump(&self.stats.delivered);
        if needs_ack && self.config.enable_message_acknowledgments {
            if let Some(sender_proc) = self.get(sender) {
                sender_proc.mailbox().push_ack(Acknowledgment {
                    message_id: id,
                    receiver: target.addr(),
                    status: AckStatus::Delivered,
                });
            }
        }
        self.notify_message_delivered(target, &value);
        DeliverOutcome::Delivered
    }

    /// Wake a waiting receiver whose predicate is satisfied by a newly
    /// delivered value.
    pub fn notify_message_delivered(&self, target: &Arc<Process>, value: &Value) {
        if !self.config.auto_reactivate_processes {
            return;
        }
        if target.state() == ProcessState::Waiting && target.wait().predicate.wakes_for(value) {
            self.scheduler.reactivate_later(target);
        }
    }

    /// Retry every blocked sender. Entries to dead targets are abandoned;
    /// per-target FIFO order is preserved by skipping entries whose
    /// earlier same-target sibling is still parked. Senders whose queue
    /// drains return to their run queue.
    pub fn check_blocked(&self) {
        for addr in self.scheduler.blocked_addrs() {
            let Some(proc) = self.get(addr) else { continue };
            if proc.state() != ProcessState::Blocked {
                continue;
            }
            let drained = {
                let mut sends = proc.blocked_sends();
                let mut still_full: Vec<Addr> = Vec::new();
                let mut index = 0;
                while index < sends.len() {
                    let target_addr = sends[index].target;
                    if still_full.contains(&target_addr) {
                        index += 1;
                        continue;
                    }
                    let outcome = match self.get(target_addr) {
                        Some(target) => {
                            let message = sends[index].message.clone();
                            self.try_deliver(&target, message)
                        }
                        None => DeliverOutcome::Dead,
                    };
                    match outcome {
                        DeliverOutcome::Delivered => {
                            let _ = sends.remove(index);
                        }
                        DeliverOutcome::Dead => {
                            // Abandon the send; try_deliver counted the
                            // drop for known-dead targets.
                            if self.get(target_addr).is_none() {
                                EngineStats::bump(&self.stats.dropped);
                            }
                            let _ = sends.remove(index);
                        }
                        DeliverOutcome::Full => {
                            still_full.push(target_addr);
                            index += 1;
                        }
                    }
                }
                sends.is_empty()
            };
            if drained {
                proc.wait().deps.clear();
                self.scheduler.make_runnable(&proc);
            }
        }
    }

    /// Sweep expired messages from every mailbox; returns how many.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut swept = 0;
        for proc in self.all_processes() {
            swept += proc.mailbox().cleanup_expired(now);
        }
        self.stats.expired.fetch_add(swept as u64, Ordering::Relaxed);
        swept
    }
}

/// Build a program from a lambda: the body becomes the main code and the
/// captured environment becomes the initial globals. Used by the spawn
/// opcodes and SimpleOneForOne child creation.
pub fn lambda_program(lambda: &Lambda) -> Program {
    let mut program = Program::new(lambda.code.as_ref().clone());
    for (name, value) in &lambda.captured {
        program.set_global(name.clone(), value.clone());
    }
    program
}

#[cfg(test)]
mod tests {
    use super::*;
    use reeve_bytecode::{Instruction, Opcode};

    fn shared() -> VmShared {
        VmShared::new(VmConfig::small())
    }

    fn nop_program() -> Program {
        Program::new(vec![Instruction::op(Opcode::Nop)])
    }

    #[test]
    fn test_spawn_assigns_monotonic_addresses() {
        let shared = shared();
        let a = shared.spawn_program(&nop_program(), None, Priority::Normal).unwrap();
        let b = shared.spawn_program(&nop_program(), None, Priority::Normal).unwrap();
        assert!(b.addr() > a.addr());
        assert_eq!(shared.live_count(), 2);
    }

    #[test]
    fn test_process_limit() {
        let mut config = VmConfig::small();
        config.max_processes = 2;
        let shared = VmShared::new(config);
        shared.spawn_program(&nop_program(), None, Priority::Normal).unwrap();
        shared.spawn_program(&nop_program(), None, Priority::Normal).unwrap();
        assert!(shared
            .spawn_program(&nop_program(), None, Priority::Normal)
            .is_err());
    }

    #[test]
    fn test_resolve_target() {
        let shared = shared();
        let p = shared.spawn_program(&nop_program(), None, Priority::Normal).unwrap();
        shared.names.register("worker", p.addr());

        assert_eq!(shared.resolve_target(&Value::Uint(p.addr())), Some(p.addr()));
        assert_eq!(shared.resolve_target(&Value::str("worker")), Some(p.addr()));
        assert_eq!(shared.resolve_target(&Value::symbol("worker")), Some(p.addr()));
        assert_eq!(shared.resolve_target(&Value::str("nobody")), None);
        assert_eq!(shared.resolve_target(&Value::Float(1.0)), None);
    }

    #[test]
    fn test_deliver_wakes_waiting_receiver() {
        let shared = shared();
        let p = shared.spawn_program(&nop_program(), None, Priority::Normal).unwrap();
        shared
            .scheduler
            .wait_for_message(&p, Default::default(), None, false);

        let message = shared.make_message(0, Value::Int(1), false);
        assert_eq!(shared.try_deliver(&p, message), DeliverOutcome::Delivered);
        let woken = shared.scheduler.drain_reactivation();
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0].addr(), p.addr());
    }

    #[test]
    fn test_deliver_to_dead_is_dropped() {
        let shared = shared();
        let p = shared.spawn_program(&nop_program(), None, Priority::Normal).unwrap();
        p.set_state(ProcessState::Dead);
        let message = shared.make_message(0, Value::Int(1), false);
        assert_eq!(shared.try_deliver(&p, message), DeliverOutcome::Dead);
        assert_eq!(shared.stats.snapshot().dropped, 1);
    }

    #[test]
    fn test_lambda_program_carries_captures() {
        let lambda = Lambda::new(vec![Instruction::op(Opcode::Halt)], vec![]).with_captures(
            [("x".to_string(), Value::Int(9))].into_iter().collect(),
        );
        let program = lambda_program(&lambda);
        assert_eq!(program.instructions.len(), 1);
        assert_eq!(program.globals["x"], Value::Int(9));
    }
}
