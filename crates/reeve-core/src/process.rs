//! Per-process execution state
//!
//! A `Process` is shared as `Arc<Process>` between the dispatch loop, the
//! scheduler, and the fault handler; each field group carries its own lock
//! so the two threads never contend on more than they touch. The whole
//! single-threaded execution state (stacks, locals, counters) lives under
//! one `Mutex<ExecState>` that the dispatch loop holds for the duration of
//! a reduction slice.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::{FxHashMap, FxHashSet};

use reeve_bytecode::{Instruction, Lambda, Program, Value};

use crate::mailbox::{matches_pattern, Mailbox};
use crate::message::{ExitReason, Message};

/// Process address: monotonic 64-bit, never reused.
pub type Addr = u64;

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Runnable or running.
    Alive,
    /// Ran past the end of its code; awaiting cleanup by the fault handler.
    Stale,
    /// Parked until a message (or timeout) arrives.
    Waiting,
    /// Parked on a send to a full mailbox.
    Blocked,
    /// Terminated; appears in no scheduler queue.
    Dead,
}

/// Scheduling priority. Each priority scales the base reduction budget:
/// Low runs a quarter slice, Max four slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Quarter of the base budget.
    Low,
    /// The base budget.
    Normal,
    /// Twice the base budget.
    High,
    /// Four times the base budget.
    Max,
}

impl Priority {
    /// Queue index, Low = 0 .. Max = 3.
    pub fn index(self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Max => 3,
        }
    }

    /// Reduction budget for one slice at this priority.
    pub fn slice_budget(self, base: u64) -> u64 {
        match self {
            Priority::Low => (base / 4).max(1),
            Priority::Normal => base,
            Priority::High => base * 2,
            Priority::Max => base * 4,
        }
    }
}

/// One call record: where to return to and how to close the frame.
#[derive(Debug, Clone)]
pub struct CallFrame {
    /// Instruction to resume at after RETURN.
    pub return_ip: usize,
    /// Frame pointer to restore.
    pub saved_fp: usize,
    /// Locals length to truncate back to.
    pub saved_locals: usize,
}

/// Globals displaced by splicing a lambda's captured environment, plus
/// the closure that was current before the call. Restored on RETURN.
#[derive(Debug)]
pub struct EnvSave {
    /// `call_stack.len()` immediately after the owning call pushed.
    pub call_depth: usize,
    /// (name, previous value) pairs; `None` means the name was unset.
    pub saved: Vec<(String, Option<Value>)>,
    /// The closure active before this call.
    pub prev_closure: Option<Lambda>,
}

/// Exception handler frame: the catch address plus every depth needed to
/// restore the execution state at unwind time. The saved-code depth is
/// tracked explicitly so unwinding across indirect calls cannot leave the
/// call stack and the saved-code stack out of step.
#[derive(Debug, Clone)]
pub struct HandlerFrame {
    /// Where THROW lands.
    pub catch_addr: usize,
    /// Data stack depth at install time.
    pub stack_depth: usize,
    /// Call stack depth at install time.
    pub call_depth: usize,
    /// Saved-code stack depth at install time.
    pub saved_code_depth: usize,
    /// Env-restore stack depth at install time.
    pub env_depth: usize,
    /// Locals length at install time.
    pub locals_depth: usize,
    /// Frame pointer at install time.
    pub frame_pointer: usize,
}

/// What a waiting process is waiting for.
#[derive(Debug, Clone, Default)]
pub enum WaitPredicate {
    /// Any message wakes the process.
    #[default]
    Any,
    /// Only a message matching this pattern wakes it.
    Pattern(Value),
    /// A matcher lambda; the process is woken to re-scan on every arrival.
    Matcher(Lambda),
    /// A timed sleep; messages do not wake it.
    Sleeping,
}

impl WaitPredicate {
    /// Whether a newly delivered value should wake the waiter. Matcher
    /// predicates always wake: the matcher runs inside the process.
    pub fn wakes_for(&self, value: &Value) -> bool {
        match self {
            WaitPredicate::Any => true,
            WaitPredicate::Pattern(pattern) => matches_pattern(value, pattern),
            WaitPredicate::Matcher(_) => true,
            WaitPredicate::Sleeping => false,
        }
    }
}

/// Park bookkeeping for a Waiting or Blocked process.
#[derive(Debug, Default)]
pub struct WaitState {
    /// What wakes the process.
    pub predicate: WaitPredicate,
    /// When the park began.
    pub since: Option<Instant>,
    /// Absolute deadline for timed waits.
    pub deadline: Option<Instant>,
    /// Whether timeout expiry pushes the `(null, false)` token and skips
    /// the re-armed receive (true for RECEIVE_*_WITH_TIMEOUT, false for
    /// SLEEP which simply resumes).
    pub timeout_token: bool,
    /// Addresses this process is waiting on, for deadlock detection.
    pub deps: FxHashSet<Addr>,
}

impl WaitState {
    /// Reset to the not-waiting default.
    pub fn clear(&mut self) {
        *self = WaitState::default();
    }
}

/// A send parked on a full target mailbox.
#[derive(Debug)]
pub struct BlockedSend {
    /// The receiving process.
    pub target: Addr,
    /// The undelivered message.
    pub message: Message,
}

/// Subroutine table entry.
#[derive(Debug, Clone, Copy)]
pub struct SubroutineEntry {
    /// Absolute start address within the process's code.
    pub start: usize,
}

/// The single-threaded execution state of a process. Only the dispatch
/// loop mutates this; everything else reads through short-lived locks.
#[derive(Debug)]
pub struct ExecState {
    /// Instruction pointer.
    pub ip: usize,
    /// The code currently executing (switched by indirect calls).
    pub code: Arc<Vec<Instruction>>,
    /// Data stack.
    pub stack: Vec<Value>,
    /// Locals, frame-relative through `frame_pointer`.
    pub locals: Vec<Value>,
    /// Base index of the current frame's locals.
    pub frame_pointer: usize,
    /// Call records, innermost last.
    pub call_stack: Vec<CallFrame>,
    /// Code blocks displaced by indirect calls, pushed in lock-step with
    /// `call_stack`.
    pub saved_code: Vec<Arc<Vec<Instruction>>>,
    /// Globals displaced by lambda environment splicing.
    pub env_saves: Vec<EnvSave>,
    /// The closure currently executing, if any.
    pub current_closure: Option<Lambda>,
    /// Process-local globals.
    pub globals: FxHashMap<String, Value>,
    /// Name → start address of callable subroutines.
    pub subroutines: FxHashMap<String, SubroutineEntry>,
    /// Installed exception handlers, innermost last.
    pub handlers: Vec<HandlerFrame>,
    /// The most recently caught exception.
    pub current_exception: Option<Value>,
    /// Set by YIELD; the dispatch loop ends the slice and requeues.
    pub yielded: bool,
}

impl ExecState {
    fn from_program(program: &Program) -> Self {
        let subroutines = program
            .subroutines
            .iter()
            .map(|s| (s.name.clone(), SubroutineEntry { start: s.start }))
            .collect();
        let globals = program
            .globals
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            ip: 0,
            code: Arc::new(program.instructions.clone()),
            stack: Vec::new(),
            locals: Vec::new(),
            frame_pointer: 0,
            call_stack: Vec::new(),
            saved_code: Vec::new(),
            env_saves: Vec::new(),
            current_closure: None,
            globals,
            subroutines,
            handlers: Vec::new(),
            current_exception: None,
            yielded: false,
        }
    }

    /// Whether the instruction pointer has run past the end of the code.
    pub fn past_end(&self) -> bool {
        self.ip >= self.code.len()
    }
}

/// A lightweight isolated process.
#[derive(Debug)]
pub struct Process {
    addr: Addr,
    parent: Option<Addr>,
    created_at: Instant,
    state: Mutex<ProcessState>,
    priority: Mutex<Priority>,
    exec: Mutex<ExecState>,
    mailbox: Mailbox,
    wait: Mutex<WaitState>,
    blocked_sends: Mutex<VecDeque<BlockedSend>>,
    flags: Mutex<FxHashMap<String, Value>>,
    registered_name: Mutex<Option<String>>,
    exit_reason: Mutex<Option<ExitReason>>,
    exit_handled: AtomicBool,
    reductions: AtomicU64,
}

impl Process {
    /// Create a process from a program. The code is deep-copied: processes
    /// are genuinely isolated, not views into a shared text segment.
    pub fn from_program(
        addr: Addr,
        parent: Option<Addr>,
        program: &Program,
        mailbox_capacity: usize,
    ) -> Self {
        Self {
            addr,
            parent,
            created_at: Instant::now(),
            state: Mutex::new(ProcessState::Alive),
            priority: Mutex::new(Priority::Normal),
            exec: Mutex::new(ExecState::from_program(program)),
            mailbox: Mailbox::new(mailbox_capacity),
            wait: Mutex::new(WaitState::default()),
            blocked_sends: Mutex::new(VecDeque::new()),
            flags: Mutex::new(FxHashMap::default()),
            registered_name: Mutex::new(None),
            exit_reason: Mutex::new(None),
            exit_handled: AtomicBool::new(false),
            reductions: AtomicU64::new(0),
        }
    }

    /// This process's address.
    pub fn addr(&self) -> Addr {
        self.addr
    }

    /// The spawning process, if any.
    pub fn parent(&self) -> Option<Addr> {
        self.parent
    }

    /// When the process was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    /// Set the lifecycle state.
    pub fn set_state(&self, state: ProcessState) {
        *self.state.lock() = state;
    }

    /// Whether the process is not yet dead or stale.
    pub fn is_alive(&self) -> bool {
        !matches!(self.state(), ProcessState::Dead | ProcessState::Stale)
    }

    /// Current priority.
    pub fn priority(&self) -> Priority {
        *self.priority.lock()
    }

    /// Set the priority.
    pub fn set_priority(&self, priority: Priority) {
        *self.priority.lock() = priority;
    }

    /// Lock the execution state. Held by the dispatch loop for a whole
    /// reduction slice.
    pub fn exec(&self) -> MutexGuard<'_, ExecState> {
        self.exec.lock()
    }

    /// The process mailbox.
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Lock the wait bookkeeping.
    pub fn wait(&self) -> MutexGuard<'_, WaitState> {
        self.wait.lock()
    }

    /// Lock the blocked-sends queue.
    pub fn blocked_sends(&self) -> MutexGuard<'_, VecDeque<BlockedSend>> {
        self.blocked_sends.lock()
    }

    /// Read a process flag.
    pub fn flag(&self, name: &str) -> Option<Value> {
        self.flags.lock().get(name).cloned()
    }

    /// Set a process flag.
    pub fn set_flag(&self, name: impl Into<String>, value: Value) {
        self.flags.lock().insert(name.into(), value);
    }

    /// The registered name, if any.
    pub fn registered_name(&self) -> Option<String> {
        self.registered_name.lock().clone()
    }

    /// Record (or clear) the registered name.
    pub fn set_registered_name(&self, name: Option<String>) {
        *self.registered_name.lock() = name;
    }

    /// The recorded exit reason, if the process has died.
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit_reason.lock().clone()
    }

    /// Record the exit reason.
    pub fn set_exit_reason(&self, reason: ExitReason) {
        *self.exit_reason.lock() = Some(reason);
    }

    /// Claim exit handling; returns true exactly once per process, making
    /// the fault handler idempotent on already-dead processes.
    pub fn claim_exit(&self) -> bool {
        !self.exit_handled.swap(true, Ordering::AcqRel)
    }

    /// Total reductions executed.
    pub fn reductions(&self) -> u64 {
        self.reductions.load(Ordering::Relaxed)
    }

    /// Add executed reductions.
    pub fn add_reductions(&self, n: u64) {
        self.reductions.fetch_add(n, Ordering::Relaxed);
    }

    /// Info map for GET_INFO and embedder inspection.
    pub fn info(&self) -> Value {
        let (stack_depth, locals, frames) = {
            let exec = self.exec.lock();
            (exec.stack.len(), exec.locals.len(), exec.call_stack.len())
        };
        let state = match self.state() {
            ProcessState::Alive => "alive",
            ProcessState::Stale => "stale",
            ProcessState::Waiting => "waiting",
            ProcessState::Blocked => "blocked",
            ProcessState::Dead => "dead",
        };
        let priority = match self.priority() {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Max => "max",
        };
        Value::map([
            ("address", Value::Uint(self.addr)),
            ("state", Value::symbol(state)),
            ("priority", Value::symbol(priority)),
            ("stack_depth", Value::Uint(stack_depth as u64)),
            ("locals", Value::Uint(locals as u64)),
            ("call_frames", Value::Uint(frames as u64)),
            ("mailbox_size", Value::Uint(self.mailbox.len() as u64)),
            ("reductions", Value::Uint(self.reductions())),
            (
                "registered_name",
                self.registered_name()
                    .map(Value::Str)
                    .unwrap_or(Value::Null),
            ),
            (
                "parent",
                self.parent.map(Value::Uint).unwrap_or(Value::Null),
            ),
            (
                "uptime_ms",
                Value::Uint(self.created_at.elapsed().as_millis() as u64),
            ),
        ])
    }

    /// Age of the current wait, if parked.
    pub fn waiting_for(&self) -> Option<Duration> {
        self.wait.lock().since.map(|s| s.elapsed())
    }
}
