//! Engine: the composition root and event loop
//!
//! Each iteration: deliver due timers, drain the reactivation queue,
//! expire timed waits, retry blocked sends, then pop the highest-priority
//! runnable process and execute one reduction slice. Dead processes are
//! handed to the fault handler; still-alive ones are re-queued. When
//! nothing can make progress the loop exits; when parked work remains it
//! sleeps a short quantum and keeps going.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use reeve_bytecode::{Program, Value};

use crate::config::VmConfig;
use crate::debug::{BreakpointFn, DebugAction, DebugHook, DebugState};
use crate::fault::FaultHandler;
use crate::interpreter::Executor;
use crate::message::ExitReason;
use crate::process::{Addr, Priority, Process, ProcessState};
use crate::shared::{DeliverOutcome, EngineStats, VmShared};
use crate::supervisor::{ChildSpec, Strategy};
use crate::VmResult;

pub use crate::shared::StatsSnapshot;

/// How long an idle iteration sleeps before re-checking.
const IDLE_QUANTUM: Duration = Duration::from_millis(1);

/// The virtual machine: scheduler loop, executor, and fault handling
/// composed over one shared state.
pub struct Engine {
    shared: Arc<VmShared>,
    fault: Arc<FaultHandler>,
    executor: Executor,
    debug: Mutex<DebugState>,
    last_sweep: Mutex<Instant>,
}

impl Engine {
    /// Build an engine and start its fault-handler thread.
    pub fn new(config: VmConfig) -> Self {
        let shared = Arc::new(VmShared::new(config));
        let fault = FaultHandler::new(Arc::clone(&shared));
        fault.start();
        let executor = Executor::new(Arc::clone(&shared), Arc::clone(&fault));
        Self {
            shared,
            fault,
            executor,
            debug: Mutex::new(DebugState::default()),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// An engine with the default configuration.
    pub fn with_defaults() -> Self {
        Self::new(VmConfig::default())
    }

    /// The shared state (process table, registries, stats).
    pub fn shared(&self) -> &Arc<VmShared> {
        &self.shared
    }

    /// The executor, for registering builtins and custom opcode handlers.
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// The engine configuration.
    pub fn config(&self) -> &VmConfig {
        &self.shared.config
    }

    // ========================================================================
    // Process management
    // ========================================================================

    /// Spawn a process at Normal priority.
    pub fn spawn(&self, program: &Program) -> VmResult<Addr> {
        self.spawn_with_priority(program, Priority::Normal)
    }

    /// Spawn a process at a given priority.
    pub fn spawn_with_priority(&self, program: &Program, priority: Priority) -> VmResult<Addr> {
        let proc = self.shared.spawn_program(program, None, priority)?;
        self.shared.scheduler.enqueue(&proc);
        Ok(proc.addr())
    }

    /// Create a supervisor: an empty-code process parked in the waiting
    /// set whose behavior lives in the supervisor registry.
    pub fn start_supervisor(
        &self,
        strategy: Strategy,
        max_restarts: u32,
        restart_window: Duration,
    ) -> VmResult<Addr> {
        let proc = self
            .shared
            .spawn_program(&Program::default(), None, Priority::Normal)?;
        // Supervisors trap exits so a child crash reaches them as a
        // message, not a death; the restart logic runs in the fault
        // handler's fan-out.
        proc.set_flag("trap_exit", Value::Bool(true));
        self.shared.links.set_trap_exit(proc.addr(), true);
        proc.set_state(ProcessState::Waiting);
        self.shared.scheduler.enqueue(&proc);
        self.shared
            .supervisors
            .register(proc.addr(), strategy, max_restarts, restart_window);
        Ok(proc.addr())
    }

    /// Start a child under a supervisor.
    pub fn start_child(&self, supervisor: Addr, spec: ChildSpec) -> VmResult<Addr> {
        self.shared
            .supervisors
            .start_child(&self.fault, &self.shared, supervisor, spec)
    }

    /// Stop a supervised child by id.
    pub fn stop_child(&self, supervisor: Addr, id: &str) -> bool {
        self.shared
            .supervisors
            .stop_child(&self.fault, &self.shared, supervisor, id)
    }

    /// Restart a supervised child by id; returns the new address.
    pub fn restart_child(&self, supervisor: Addr, id: &str) -> Option<Addr> {
        self.shared
            .supervisors
            .restart_child(&self.fault, &self.shared, supervisor, id)
    }

    /// Deliver a value to a process from outside (sender address 0).
    pub fn send(&self, target: Addr, value: Value) -> bool {
        EngineStats::bump(&self.shared.stats.sent);
        let Some(proc) = self.shared.get(target) else {
            EngineStats::bump(&self.shared.stats.dropped);
            return false;
        };
        let message = self.shared.make_message(0, value, false);
        self.shared.try_deliver(&proc, message) == DeliverOutcome::Delivered
    }

    /// Kill a process from outside.
    pub fn kill(&self, target: Addr) {
        if let Some(proc) = self.shared.get(target) {
            self.fault.notify_exit(&proc, ExitReason::Kill);
        }
    }

    /// Info map for a process, dead or alive.
    pub fn process_info(&self, addr: Addr) -> Option<Value> {
        self.shared.get(addr).map(|p| p.info())
    }

    /// Clone of a process's data stack (inspection and tests).
    pub fn data_stack(&self, addr: Addr) -> Option<Vec<Value>> {
        self.shared.get(addr).map(|p| p.exec().stack.clone())
    }

    /// The exit reason recorded for a dead process.
    pub fn exit_reason(&self, addr: Addr) -> Option<ExitReason> {
        self.shared.get(addr).and_then(|p| p.exit_reason())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    // ========================================================================
    // Debugger
    // ========================================================================

    /// Install (or clear) the debugger hook.
    pub fn set_debug_hook(&self, hook: Option<Arc<dyn DebugHook>>) {
        self.debug.lock().hook = hook;
    }

    /// Install (or clear) the breakpoint predicate.
    pub fn set_breakpoint(&self, breakpoint: Option<BreakpointFn>) {
        self.debug.lock().breakpoint = breakpoint;
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Run until quiescent or the configured iteration limit. Returns the
    /// number of iterations executed.
    pub fn run(&self) -> usize {
        self.run_for(self.shared.config.iteration_limit)
    }

    /// Run at most `limit` iterations.
    pub fn run_for(&self, limit: usize) -> usize {
        let mut iterations = 0;
        let mut idle_ticks = 0u32;

        while iterations < limit {
            iterations += 1;
            EngineStats::bump(&self.shared.stats.iterations);
            let now = Instant::now();

            // Due timers become ordinary deliveries.
            for (target, message) in self.shared.timers.due(now) {
                match self.shared.get(target) {
                    Some(proc) => {
                        self.shared.try_deliver(&proc, message);
                    }
                    None => EngineStats::bump(&self.shared.stats.dropped),
                }
            }

            self.maybe_sweep(now);

            // Receivers woken by deliveries since the last iteration.
            for proc in self.shared.scheduler.drain_reactivation() {
                if proc.state() == ProcessState::Waiting {
                    self.shared.scheduler.make_runnable(&proc);
                }
            }

            self.shared.scheduler.check_timeouts(now);
            self.shared.check_blocked();

            let Some(addr) = self.shared.scheduler.next_runnable() else {
                if self.work_can_progress() {
                    idle_ticks += 1;
                    if idle_ticks >= self.shared.config.deadlock_scan_after_idle_ticks {
                        self.detect_deadlocks();
                        idle_ticks = 0;
                    }
                    thread::sleep(IDLE_QUANTUM);
                    continue;
                }
                // Only indefinite waiters (if anything) remain; nothing
                // can wake them.
                break;
            };
            idle_ticks = 0;

            let Some(proc) = self.shared.get(addr) else {
                continue;
            };
            if proc.state() != ProcessState::Alive {
                continue;
            }

            self.execute_slice(&proc);
            self.reclassify(&proc);
        }

        if iterations >= limit {
            log::warn!("engine stopped at the iteration limit ({})", limit);
            self.detect_deadlocks();
        }
        iterations
    }

    /// Whether any parked work can still make progress without outside
    /// input: timed waits, pending timers, blocked sends, queued wakes,
    /// or in-flight fault work.
    fn work_can_progress(&self) -> bool {
        self.shared.scheduler.has_pending() && {
            // Indefinite waiters alone cannot progress; check for an
            // actual wake source.
            !self.shared.scheduler.blocked_addrs().is_empty()
                || self
                    .shared
                    .all_processes()
                    .iter()
                    .any(|p| p.state() == ProcessState::Waiting && p.wait().deadline.is_some())
        } || self.shared.timers.pending_count() > 0
            || !self.fault.is_idle()
    }

    fn execute_slice(&self, proc: &Arc<Process>) {
        EngineStats::bump(&self.shared.stats.context_switches);
        let budget = proc
            .priority()
            .slice_budget(self.shared.config.max_reductions_per_slice);

        let mut exec = proc.exec();

        // A supervisor's code is empty; it parks instead of running.
        if exec.code.is_empty() && self.shared.supervisors.is_supervisor(proc.addr()) {
            drop(exec);
            proc.set_state(ProcessState::Waiting);
            self.shared.scheduler.enqueue(proc);
            return;
        }

        let mut used = 0u64;
        while used < budget {
            if proc.state() != ProcessState::Alive {
                break;
            }
            if exec.yielded {
                exec.yielded = false;
                break;
            }
            let Some(instr) = exec.code.get(exec.ip).cloned() else {
                // Ran past the end of its code.
                proc.set_state(ProcessState::Stale);
                break;
            };
            if self.debug_check(proc, &instr) == Some(DebugAction::Abort) {
                drop(exec);
                self.fault.notify_exit(proc, ExitReason::Kill);
                proc.add_reductions(used);
                return;
            }
            self.executor.execute(proc, &mut exec, &instr);
            used += 1;
        }
        drop(exec);
        proc.add_reductions(used);
    }

    fn reclassify(&self, proc: &Arc<Process>) {
        match proc.state() {
            // Budget spent or yielded: back of its priority queue.
            ProcessState::Alive => self.shared.scheduler.yield_process(proc),
            // Fell off the end of its code: a clean exit.
            ProcessState::Stale => self.fault.notify_exit(proc, ExitReason::Normal),
            ProcessState::Dead => {
                let reason = proc.exit_reason().unwrap_or(ExitReason::Normal);
                self.fault.notify_exit(proc, reason);
            }
            // The parking opcode already placed it.
            ProcessState::Waiting | ProcessState::Blocked => {}
        }
    }

    fn debug_check(
        &self,
        proc: &Arc<Process>,
        instr: &reeve_bytecode::Instruction,
    ) -> Option<DebugAction> {
        let mut debug = self.debug.lock();
        let hook = debug.hook.clone()?;
        let armed = debug.stepping
            || debug
                .breakpoint
                .as_ref()
                .map(|matches| matches(proc, instr))
                .unwrap_or(false);
        if !armed {
            return None;
        }
        let action = hook.on_instruction(proc, instr);
        match action {
            DebugAction::Continue | DebugAction::Abort => debug.stepping = false,
            DebugAction::Step | DebugAction::StepOver => debug.stepping = true,
        }
        Some(action)
    }

    fn maybe_sweep(&self, now: Instant) {
        let mut last = self.last_sweep.lock();
        if now.duration_since(*last) >= self.shared.config.message_cleanup_interval {
            *last = now;
            drop(last);
            let swept = self.shared.sweep_expired(now);
            if swept > 0 {
                log::debug!("swept {} expired messages", swept);
            }
        }
    }

    /// Build the wait-for graph from parked processes' dependency sets
    /// and look for a cycle. Cycles are logged and counted, never
    /// auto-recovered.
    fn detect_deadlocks(&self) {
        let mut graph: FxHashMap<Addr, Vec<Addr>> = FxHashMap::default();
        for proc in self.shared.all_processes() {
            if matches!(
                proc.state(),
                ProcessState::Waiting | ProcessState::Blocked
            ) {
                let deps: Vec<Addr> = proc.wait().deps.iter().copied().collect();
                if !deps.is_empty() {
                    graph.insert(proc.addr(), deps);
                }
            }
        }
        if graph.is_empty() {
            return;
        }

        let mut visited: FxHashSet<Addr> = FxHashSet::default();
        let mut on_path: FxHashSet<Addr> = FxHashSet::default();
        for &start in graph.keys() {
            if visited.contains(&start) {
                continue;
            }
            if let Some(cycle) = dfs_cycle(&graph, start, &mut visited, &mut on_path) {
                log::warn!("deadlock detected among processes {:?}", cycle);
                EngineStats::bump(&self.shared.stats.deadlocks_detected);
                return;
            }
        }
    }

    /// Stop the fault-handler thread.
    pub fn shutdown(&self) {
        self.fault.stop();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dfs_cycle(
    graph: &FxHashMap<Addr, Vec<Addr>>,
    node: Addr,
    visited: &mut FxHashSet<Addr>,
    on_path: &mut FxHashSet<Addr>,
) -> Option<Vec<Addr>> {
    if on_path.contains(&node) {
        return Some(on_path.iter().copied().collect());
    }
    if !visited.insert(node) {
        return None;
    }
    on_path.insert(node);
    if let Some(deps) = graph.get(&node) {
        for &next in deps {
            if graph.contains_key(&next) {
                if let Some(cycle) = dfs_cycle(graph, next, visited, on_path) {
                    return Some(cycle);
                }
            }
        }
    }
    on_path.remove(&node);
    None
}
