//! Supervision trees
//!
//! A supervisor is a process with an empty instruction list; its behavior
//! lives here. The registry records child specs in start order, per-child
//! sliding restart histories, and the strategy that decides which children
//! terminate and restart when one exits.
//!
//! Lock discipline: restart plans are computed under the registry lock,
//! then executed after it is released. Terminated children are removed
//! from the child index first, so their deaths do not re-enter the
//! supervisor logic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use reeve_bytecode::{Program, Value};

use crate::fault::FaultHandler;
use crate::message::ExitReason;
use crate::process::{Addr, Priority, Process, ProcessState};
use crate::shared::VmShared;
use crate::{VmError, VmResult};

/// What kind of process a child spec starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChildKind {
    /// An ordinary worker process.
    #[default]
    Worker,
    /// A nested supervisor.
    Supervisor,
}

/// When a child is restarted after exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Always restarted.
    #[default]
    Permanent,
    /// Restarted only after an abnormal exit.
    Transient,
    /// Never restarted.
    Temporary,
}

/// How a child is terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Kill immediately.
    Brutal,
    /// Ask politely, force-kill after the duration.
    Timeout(Duration),
    /// Ask politely and wait forever.
    Infinity,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        ShutdownPolicy::Timeout(Duration::from_secs(5))
    }
}

/// Which children a restart affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Restart only the failed child.
    #[default]
    OneForOne,
    /// Terminate and restart every child.
    OneForAll,
    /// Terminate and restart the failed child and everyone started after.
    RestForOne,
    /// OneForOne for dynamically started children of one shape.
    SimpleOneForOne,
}

/// Specification of one supervised child.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    /// Unique child id within its supervisor.
    pub id: String,
    /// The code, subroutines, and globals the child runs.
    pub program: Program,
    /// Worker or nested supervisor.
    pub kind: ChildKind,
    /// Restart policy.
    pub restart: RestartPolicy,
    /// Shutdown policy.
    pub shutdown: ShutdownPolicy,
}

impl ChildSpec {
    /// A permanent worker spec with the default shutdown.
    pub fn new(id: impl Into<String>, program: Program) -> Self {
        Self {
            id: id.into(),
            program,
            kind: ChildKind::default(),
            restart: RestartPolicy::default(),
            shutdown: ShutdownPolicy::default(),
        }
    }

    /// Parse the map shape used by the supervisor opcodes:
    /// `{id, instructions, subroutines?, globals?, type?, restart?,
    /// shutdown?}` where shutdown is `"brutal"`, `"infinity"`, or a
    /// number of seconds.
    pub fn from_value(value: &Value) -> VmResult<Self> {
        let Value::Map(map) = value else {
            return Err(VmError::TypeMismatch {
                expected: "child spec map".into(),
                found: value.type_name().into(),
            });
        };
        let id = map
            .get("id")
            .and_then(|v| v.as_name())
            .ok_or_else(|| VmError::Value("child spec is missing an id".into()))?
            .to_string();
        let code = match map.get("instructions") {
            Some(Value::Instructions(code)) => code.as_ref().clone(),
            Some(other) => {
                return Err(VmError::TypeMismatch {
                    expected: "instructions".into(),
                    found: other.type_name().into(),
                })
            }
            None => return Err(VmError::Value("child spec is missing instructions".into())),
        };
        let mut program = Program::new(code);
        if let Some(Value::Map(subs)) = map.get("subroutines") {
            for (name, body) in subs {
                if let Value::Instructions(code) = body {
                    program.add_subroutine(name.clone(), code.as_ref().clone());
                }
            }
        }
        if let Some(Value::Map(globals)) = map.get("globals") {
            for (name, v) in globals {
                program.set_global(name.clone(), v.clone());
            }
        }
        let kind = match map.get("type").and_then(|v| v.as_name()) {
            Some("supervisor") => ChildKind::Supervisor,
            _ => ChildKind::Worker,
        };
        let restart = match map.get("restart").and_then(|v| v.as_name()) {
            Some("transient") => RestartPolicy::Transient,
            Some("temporary") => RestartPolicy::Temporary,
            _ => RestartPolicy::Permanent,
        };
        let shutdown = match map.get("shutdown") {
            Some(v) if v.as_name() == Some("brutal") => ShutdownPolicy::Brutal,
            Some(v) if v.as_name() == Some("infinity") => ShutdownPolicy::Infinity,
            Some(v) if v.is_numeric() => {
                ShutdownPolicy::Timeout(Duration::from_secs_f64(v.as_f64().unwrap_or(5.0)))
            }
            _ => ShutdownPolicy::default(),
        };
        Ok(Self {
            id,
            program,
            kind,
            restart,
            shutdown,
        })
    }
}

#[derive(Debug)]
struct ChildState {
    spec: ChildSpec,
    current: Option<Addr>,
    restarts: Vec<Instant>,
}

impl ChildState {
    /// Record one restart; prunes entries older than the window and
    /// returns true iff the total is still within `max_restarts`.
    fn record_restart(&mut self, now: Instant, window: Duration, max_restarts: u32) -> bool {
        self.restarts.retain(|t| now.duration_since(*t) <= window);
        self.restarts.push(now);
        self.restarts.len() as u32 <= max_restarts
    }
}

#[derive(Debug)]
struct SupervisorState {
    strategy: Strategy,
    max_restarts: u32,
    restart_window: Duration,
    children: Vec<ChildState>,
}

#[derive(Debug, Default)]
struct SupInner {
    sups: FxHashMap<Addr, SupervisorState>,
    child_index: FxHashMap<Addr, Addr>,
}

/// One planned termination: the process and how to stop it.
struct Termination {
    proc: Addr,
    shutdown: ShutdownPolicy,
}

enum Plan {
    Nothing,
    Restart {
        sup_addr: Addr,
        terminations: Vec<Termination>,
        restart_ids: Vec<String>,
    },
    ShutdownSupervisor {
        sup_addr: Addr,
        terminations: Vec<Termination>,
    },
}

/// All supervisors of one engine.
#[derive(Debug, Default)]
pub struct SupervisorRegistry {
    inner: Mutex<SupInner>,
}

impl SupervisorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a supervisor process.
    pub fn register(
        &self,
        addr: Addr,
        strategy: Strategy,
        max_restarts: u32,
        restart_window: Duration,
    ) {
        self.inner.lock().sups.insert(
            addr,
            SupervisorState {
                strategy,
                max_restarts,
                restart_window,
                children: Vec::new(),
            },
        );
    }

    /// Whether the address is a registered supervisor.
    pub fn is_supervisor(&self, addr: Addr) -> bool {
        self.inner.lock().sups.contains_key(&addr)
    }

    /// The supervisor overseeing `child`, if any.
    pub fn supervisor_of(&self, child: Addr) -> Option<Addr> {
        self.inner.lock().child_index.get(&child).copied()
    }

    /// The running address of a child by id.
    pub fn child_addr(&self, sup_addr: Addr, id: &str) -> Option<Addr> {
        let inner = self.inner.lock();
        inner
            .sups
            .get(&sup_addr)?
            .children
            .iter()
            .find(|c| c.spec.id == id)
            .and_then(|c| c.current)
    }

    /// Start a child under a supervisor: spawn from the spec, link the
    /// pair, enqueue, and record the child.
    pub fn start_child(
        &self,
        fault: &FaultHandler,
        shared: &VmShared,
        sup_addr: Addr,
        spec: ChildSpec,
    ) -> VmResult<Addr> {
        {
            let inner = self.inner.lock();
            let state = inner
                .sups
                .get(&sup_addr)
                .ok_or_else(|| VmError::InvalidAddress(format!("no supervisor {}", sup_addr)))?;
            if state
                .children
                .iter()
                .any(|c| c.spec.id == spec.id && c.current.is_some())
            {
                return Err(VmError::Value(format!(
                    "child id {:?} already running",
                    spec.id
                )));
            }
        }

        let child = self.spawn_child(fault, shared, sup_addr, &spec)?;
        let child_addr = child.addr();

        let mut inner = self.inner.lock();
        inner.child_index.insert(child_addr, sup_addr);
        if let Some(state) = inner.sups.get_mut(&sup_addr) {
            if let Some(existing) = state.children.iter_mut().find(|c| c.spec.id == spec.id) {
                existing.spec = spec;
                existing.current = Some(child_addr);
            } else {
                state.children.push(ChildState {
                    spec,
                    current: Some(child_addr),
                    restarts: Vec::new(),
                });
            }
        }
        Ok(child_addr)
    }

    fn spawn_child(
        &self,
        _fault: &FaultHandler,
        shared: &VmShared,
        sup_addr: Addr,
        spec: &ChildSpec,
    ) -> VmResult<Arc<Process>> {
        let child = shared.spawn_program(&spec.program, Some(sup_addr), Priority::Normal)?;
        shared.links.link(sup_addr, child.addr());
        if spec.kind == ChildKind::Supervisor {
            // Nested supervisors start with the defaults; embedders add
            // their children afterwards. They trap exits like any
            // supervisor.
            self.register(
                child.addr(),
                Strategy::OneForOne,
                3,
                Duration::from_secs(5),
            );
            child.set_flag("trap_exit", Value::Bool(true));
            shared.links.set_trap_exit(child.addr(), true);
            child.set_state(ProcessState::Waiting);
        }
        shared.scheduler.enqueue(&child);
        Ok(child)
    }

    /// Stop a child by id. Returns false if the id is unknown or already
    /// stopped.
    pub fn stop_child(
        &self,
        fault: &FaultHandler,
        shared: &VmShared,
        sup_addr: Addr,
        id: &str,
    ) -> bool {
        let termination = {
            let mut inner = self.inner.lock();
            let Some(state) = inner.sups.get_mut(&sup_addr) else {
                return false;
            };
            let Some(child) = state.children.iter_mut().find(|c| c.spec.id == id) else {
                return false;
            };
            let Some(addr) = child.current.take() else {
                return false;
            };
            let shutdown = child.spec.shutdown;
            inner.child_index.remove(&addr);
            Termination {
                proc: addr,
                shutdown,
            }
        };
        self.terminate(fault, shared, &termination);
        true
    }

    /// Stop and start a child by id. Returns the new address.
    pub fn restart_child(
        &self,
        fault: &FaultHandler,
        shared: &VmShared,
        sup_addr: Addr,
        id: &str,
    ) -> Option<Addr> {
        self.stop_child(fault, shared, sup_addr, id);
        let spec = {
            let inner = self.inner.lock();
            inner
                .sups
                .get(&sup_addr)?
                .children
                .iter()
                .find(|c| c.spec.id == id)
                .map(|c| c.spec.clone())?
        };
        self.start_child(fault, shared, sup_addr, spec).ok()
    }

    /// Child info maps, in start order.
    pub fn list_children(&self, sup_addr: Addr) -> Value {
        let inner = self.inner.lock();
        let Some(state) = inner.sups.get(&sup_addr) else {
            return Value::Array(Vec::new());
        };
        Value::Array(
            state
                .children
                .iter()
                .map(|c| {
                    Value::map([
                        ("id", Value::str(c.spec.id.clone())),
                        ("pid", c.current.map(Value::Uint).unwrap_or(Value::Null)),
                        (
                            "type",
                            Value::symbol(match c.spec.kind {
                                ChildKind::Worker => "worker",
                                ChildKind::Supervisor => "supervisor",
                            }),
                        ),
                        (
                            "restart",
                            Value::symbol(match c.spec.restart {
                                RestartPolicy::Permanent => "permanent",
                                RestartPolicy::Transient => "transient",
                                RestartPolicy::Temporary => "temporary",
                            }),
                        ),
                        ("restarts", Value::Uint(c.restarts.len() as u64)),
                    ])
                })
                .collect(),
        )
    }

    /// Count map in the conventional shape:
    /// `{specs, active, supervisors, workers}`.
    pub fn count_children(&self, sup_addr: Addr) -> Value {
        let inner = self.inner.lock();
        let Some(state) = inner.sups.get(&sup_addr) else {
            return Value::Null;
        };
        let specs = state.children.len() as u64;
        let active = state
            .children
            .iter()
            .filter(|c| c.current.is_some())
            .count() as u64;
        let supervisors = state
            .children
            .iter()
            .filter(|c| c.spec.kind == ChildKind::Supervisor)
            .count() as u64;
        Value::map([
            ("specs", Value::Uint(specs)),
            ("active", Value::Uint(active)),
            ("supervisors", Value::Uint(supervisors)),
            ("workers", Value::Uint(specs - supervisors)),
        ])
    }

    /// React to a supervised child's exit: consult the restart policy and
    /// history, then apply the strategy. Called by the fault handler
    /// during fan-out.
    pub fn handle_child_exit(
        &self,
        fault: &FaultHandler,
        shared: &VmShared,
        child_addr: Addr,
        reason: &ExitReason,
    ) {
        let plan = self.plan_for_exit(shared, child_addr, reason);
        match plan {
            Plan::Nothing => {}
            Plan::Restart {
                sup_addr,
                terminations,
                restart_ids,
            } => {
                for termination in &terminations {
                    self.terminate(fault, shared, termination);
                }
                for id in restart_ids {
                    self.respawn(fault, shared, sup_addr, &id);
                }
            }
            Plan::ShutdownSupervisor {
                sup_addr,
                terminations,
            } => {
                for termination in &terminations {
                    self.terminate(fault, shared, termination);
                }
                if let Some(sup) = shared.get(sup_addr) {
                    fault.handle_exit(&sup, ExitReason::Shutdown);
                }
            }
        }
    }

    fn plan_for_exit(&self, shared: &VmShared, child_addr: Addr, reason: &ExitReason) -> Plan {
        let mut inner = self.inner.lock();
        let Some(sup_addr) = inner.child_index.remove(&child_addr) else {
            return Plan::Nothing;
        };

        if !shared.is_alive(sup_addr) {
            // The supervisor itself is gone; links already took care of
            // the children.
            inner.sups.remove(&sup_addr);
            return Plan::Nothing;
        }

        // Pull everything the plan needs out of the state in one scope so
        // drain_running can re-borrow the whole inner afterwards.
        let (strategy, failed_index, failed_id, all_ids, rest_ids, should_restart, within_limit) = {
            let Some(state) = inner.sups.get_mut(&sup_addr) else {
                return Plan::Nothing;
            };
            let Some(failed_index) = state
                .children
                .iter()
                .position(|c| c.current == Some(child_addr))
            else {
                return Plan::Nothing;
            };
            state.children[failed_index].current = None;

            let should_restart = match state.children[failed_index].spec.restart {
                RestartPolicy::Permanent => true,
                RestartPolicy::Transient => reason.is_abnormal(),
                RestartPolicy::Temporary => false,
            };
            let (window, max_restarts) = (state.restart_window, state.max_restarts);
            let within_limit = !should_restart
                || state.children[failed_index].record_restart(
                    Instant::now(),
                    window,
                    max_restarts,
                );
            let failed_id = state.children[failed_index].spec.id.clone();
            let all_ids: Vec<String> =
                state.children.iter().map(|c| c.spec.id.clone()).collect();
            let rest_ids: Vec<String> = state.children[failed_index..]
                .iter()
                .map(|c| c.spec.id.clone())
                .collect();
            (
                state.strategy,
                failed_index,
                failed_id,
                all_ids,
                rest_ids,
                should_restart,
                within_limit,
            )
        };

        if !should_restart {
            return Plan::Nothing;
        }

        if !within_limit {
            return match strategy {
                Strategy::OneForOne | Strategy::SimpleOneForOne => {
                    log::warn!(
                        "supervisor {}: child {:?} exceeded restart intensity, leaving it down",
                        sup_addr,
                        failed_id
                    );
                    Plan::Nothing
                }
                Strategy::OneForAll | Strategy::RestForOne => {
                    log::warn!(
                        "supervisor {}: restart intensity exceeded, shutting down",
                        sup_addr
                    );
                    let terminations = Self::drain_running(&mut inner, sup_addr, 0);
                    inner.sups.remove(&sup_addr);
                    Plan::ShutdownSupervisor {
                        sup_addr,
                        terminations,
                    }
                }
            };
        }

        match strategy {
            Strategy::OneForOne | Strategy::SimpleOneForOne => Plan::Restart {
                sup_addr,
                terminations: Vec::new(),
                restart_ids: vec![failed_id],
            },
            Strategy::OneForAll => Plan::Restart {
                sup_addr,
                terminations: Self::drain_running(&mut inner, sup_addr, 0),
                restart_ids: all_ids,
            },
            Strategy::RestForOne => Plan::Restart {
                sup_addr,
                terminations: Self::drain_running(&mut inner, sup_addr, failed_index),
                restart_ids: rest_ids,
            },
        }
    }

    /// Under the registry lock: take every running child from `from`
    /// onward out of the index and return terminations in reverse start
    /// order.
    fn drain_running(inner: &mut SupInner, sup_addr: Addr, from: usize) -> Vec<Termination> {
        let mut terminations = Vec::new();
        if let Some(state) = inner.sups.get_mut(&sup_addr) {
            for child in state.children[from..].iter_mut() {
                if let Some(addr) = child.current.take() {
                    terminations.push(Termination {
                        proc: addr,
                        shutdown: child.spec.shutdown,
                    });
                }
            }
        }
        for termination in &terminations {
            inner.child_index.remove(&termination.proc);
        }
        terminations.reverse();
        terminations
    }

    fn respawn(&self, fault: &FaultHandler, shared: &VmShared, sup_addr: Addr, id: &str) {
        let spec = {
            let inner = self.inner.lock();
            let Some(state) = inner.sups.get(&sup_addr) else {
                return;
            };
            let Some(child) = state.children.iter().find(|c| c.spec.id == id) else {
                return;
            };
            child.spec.clone()
        };
        match self.spawn_child(fault, shared, sup_addr, &spec) {
            Ok(child) => {
                let mut inner = self.inner.lock();
                inner.child_index.insert(child.addr(), sup_addr);
                if let Some(state) = inner.sups.get_mut(&sup_addr) {
                    if let Some(entry) = state.children.iter_mut().find(|c| c.spec.id == id) {
                        entry.current = Some(child.addr());
                    }
                }
            }
            Err(err) => {
                log::warn!(
                    "supervisor {}: failed to restart child {:?}: {}",
                    sup_addr,
                    id,
                    err
                );
            }
        }
    }

    fn terminate(&self, fault: &FaultHandler, shared: &VmShared, termination: &Termination) {
        let Some(proc) = shared.get(termination.proc) else {
            return;
        };
        if !proc.is_alive() {
            return;
        }
        match termination.shutdown {
            ShutdownPolicy::Brutal => fault.handle_exit(&proc, ExitReason::Kill),
            ShutdownPolicy::Timeout(limit) => {
                self.request_shutdown(shared, &proc);
                let start = Instant::now();
                while proc.is_alive() && start.elapsed() < limit {
                    std::thread::sleep(Duration::from_millis(1));
                }
                if proc.is_alive() {
                    fault.handle_exit(&proc, ExitReason::Kill);
                }
            }
            ShutdownPolicy::Infinity => {
                self.request_shutdown(shared, &proc);
                while proc.is_alive() {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    fn request_shutdown(&self, shared: &VmShared, proc: &Arc<Process>) {
        let value = Value::map([("signal", Value::str("shutdown"))]);
        let message = shared.make_message(0, value, false);
        let _ = shared.try_deliver(proc, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use reeve_bytecode::{Instruction, Opcode};

    fn setup() -> (Arc<VmShared>, Arc<FaultHandler>) {
        let shared = Arc::new(VmShared::new(VmConfig::small()));
        let fault = FaultHandler::new(Arc::clone(&shared));
        (shared, fault)
    }

    fn sup(shared: &VmShared, registry: &SupervisorRegistry, strategy: Strategy) -> Addr {
        let program = Program::default();
        let proc = shared
            .spawn_program(&program, None, Priority::Normal)
            .unwrap();
        proc.set_state(ProcessState::Waiting);
        registry.register(proc.addr(), strategy, 3, Duration::from_secs(5));
        proc.addr()
    }

    fn worker_spec(id: &str) -> ChildSpec {
        let mut spec = ChildSpec::new(id, Program::new(vec![Instruction::op(Opcode::Receive)]));
        spec.shutdown = ShutdownPolicy::Brutal;
        spec
    }

    #[test]
    fn test_start_child_links_and_records() {
        let (shared, fault) = setup();
        let registry = &shared.supervisors;
        let sup_addr = sup(&shared, registry, Strategy::OneForOne);
        let child = registry
            .start_child(&fault, &shared, sup_addr, worker_spec("w1"))
            .unwrap();

        assert!(shared.links.is_linked(sup_addr, child));
        assert_eq!(registry.supervisor_of(child), Some(sup_addr));
        assert_eq!(registry.child_addr(sup_addr, "w1"), Some(child));
        if let Value::Map(counts) = registry.count_children(sup_addr) {
            assert_eq!(counts["specs"], Value::Uint(1));
            assert_eq!(counts["active"], Value::Uint(1));
            assert_eq!(counts["workers"], Value::Uint(1));
        } else {
            panic!("expected a count map");
        }
    }

    #[test]
    fn test_duplicate_running_id_rejected() {
        let (shared, fault) = setup();
        let registry = &shared.supervisors;
        let sup_addr = sup(&shared, registry, Strategy::OneForOne);
        registry
            .start_child(&fault, &shared, sup_addr, worker_spec("w1"))
            .unwrap();
        assert!(registry
            .start_child(&fault, &shared, sup_addr, worker_spec("w1"))
            .is_err());
    }

    #[test]
    fn test_permanent_child_restarts() {
        let (shared, fault) = setup();
        let registry = &shared.supervisors;
        let sup_addr = sup(&shared, registry, Strategy::OneForOne);
        let child = registry
            .start_child(&fault, &shared, sup_addr, worker_spec("w1"))
            .unwrap();

        let proc = shared.get(child).unwrap();
        fault.handle_exit(&proc, ExitReason::Custom(Value::symbol("boom")));

        let replacement = registry
            .child_addr(sup_addr, "w1")
            .expect("child restarted");
        assert_ne!(replacement, child);
        assert!(shared.is_alive(replacement));
        assert_eq!(registry.supervisor_of(replacement), Some(sup_addr));
        assert_eq!(registry.supervisor_of(child), None);
    }

    #[test]
    fn test_temporary_child_never_restarts() {
        let (shared, fault) = setup();
        let registry = &shared.supervisors;
        let sup_addr = sup(&shared, registry, Strategy::OneForOne);
        let mut spec = worker_spec("w1");
        spec.restart = RestartPolicy::Temporary;
        let child = registry
            .start_child(&fault, &shared, sup_addr, spec)
            .unwrap();

        let proc = shared.get(child).unwrap();
        fault.handle_exit(&proc, ExitReason::Custom(Value::symbol("boom")));

        assert_eq!(registry.child_addr(sup_addr, "w1"), None);
    }

    #[test]
    fn test_transient_child_skips_normal_exit() {
        let (shared, fault) = setup();
        let registry = &shared.supervisors;
        let sup_addr = sup(&shared, registry, Strategy::OneForOne);
        let mut spec = worker_spec("w1");
        spec.restart = RestartPolicy::Transient;
        let child = registry
            .start_child(&fault, &shared, sup_addr, spec)
            .unwrap();

        let proc = shared.get(child).unwrap();
        fault.handle_exit(&proc, ExitReason::Normal);
        assert_eq!(registry.child_addr(sup_addr, "w1"), None);

        // An abnormal exit does restart a transient child.
        let mut spec = worker_spec("w2");
        spec.restart = RestartPolicy::Transient;
        let child = registry
            .start_child(&fault, &shared, sup_addr, spec)
            .unwrap();
        let proc = shared.get(child).unwrap();
        fault.handle_exit(&proc, ExitReason::Custom(Value::symbol("boom")));
        assert!(registry.child_addr(sup_addr, "w2").is_some());
    }

    #[test]
    fn test_restart_limit_leaves_child_down() {
        let (shared, fault) = setup();
        let registry = &shared.supervisors;
        let sup_addr = sup(&shared, registry, Strategy::OneForOne);
        registry
            .start_child(&fault, &shared, sup_addr, worker_spec("w1"))
            .unwrap();

        // max_restarts = 3: the fourth failure within the window stays down.
        for _ in 0..4 {
            let Some(addr) = registry.child_addr(sup_addr, "w1") else {
                break;
            };
            let proc = shared.get(addr).unwrap();
            fault.handle_exit(&proc, ExitReason::Custom(Value::symbol("boom")));
        }

        assert_eq!(registry.child_addr(sup_addr, "w1"), None);
        // Supervisor survives under OneForOne.
        assert!(registry.is_supervisor(sup_addr));
        assert!(shared.is_alive(sup_addr));
    }

    #[test]
    fn test_one_for_all_restarts_siblings() {
        let (shared, fault) = setup();
        let registry = &shared.supervisors;
        let sup_addr = sup(&shared, registry, Strategy::OneForAll);
        let first = registry
            .start_child(&fault, &shared, sup_addr, worker_spec("w1"))
            .unwrap();
        let second = registry
            .start_child(&fault, &shared, sup_addr, worker_spec("w2"))
            .unwrap();

        let proc = shared.get(first).unwrap();
        fault.handle_exit(&proc, ExitReason::Custom(Value::symbol("boom")));

        let new_first = registry.child_addr(sup_addr, "w1").unwrap();
        let new_second = registry.child_addr(sup_addr, "w2").unwrap();
        assert_ne!(new_first, first);
        assert_ne!(new_second, second);
        assert!(shared.is_alive(new_first));
        assert!(shared.is_alive(new_second));
    }

    #[test]
    fn test_rest_for_one_spares_earlier_children() {
        let (shared, fault) = setup();
        let registry = &shared.supervisors;
        let sup_addr = sup(&shared, registry, Strategy::RestForOne);
        let first = registry
            .start_child(&fault, &shared, sup_addr, worker_spec("w1"))
            .unwrap();
        let second = registry
            .start_child(&fault, &shared, sup_addr, worker_spec("w2"))
            .unwrap();
        let third = registry
            .start_child(&fault, &shared, sup_addr, worker_spec("w3"))
            .unwrap();

        let proc = shared.get(second).unwrap();
        fault.handle_exit(&proc, ExitReason::Custom(Value::symbol("boom")));

        assert_eq!(registry.child_addr(sup_addr, "w1"), Some(first));
        assert_ne!(registry.child_addr(sup_addr, "w2").unwrap(), second);
        assert_ne!(registry.child_addr(sup_addr, "w3").unwrap(), third);
    }

    #[test]
    fn test_stop_child() {
        let (shared, fault) = setup();
        let registry = &shared.supervisors;
        let sup_addr = sup(&shared, registry, Strategy::OneForOne);
        let child = registry
            .start_child(&fault, &shared, sup_addr, worker_spec("w1"))
            .unwrap();

        assert!(registry.stop_child(&fault, &shared, sup_addr, "w1"));
        assert!(!shared.is_alive(child));
        // Stopping an already-stopped child fails.
        assert!(!registry.stop_child(&fault, &shared, sup_addr, "w1"));
        // A deliberate stop does not trigger a restart.
        assert_eq!(registry.child_addr(sup_addr, "w1"), None);
    }

    #[test]
    fn test_restart_child_by_id() {
        let (shared, fault) = setup();
        let registry = &shared.supervisors;
        let sup_addr = sup(&shared, registry, Strategy::OneForOne);
        let child = registry
            .start_child(&fault, &shared, sup_addr, worker_spec("w1"))
            .unwrap();

        let replacement = registry
            .restart_child(&fault, &shared, sup_addr, "w1")
            .unwrap();
        assert_ne!(replacement, child);
        assert!(!shared.is_alive(child));
        assert!(shared.is_alive(replacement));
    }

    #[test]
    fn test_child_spec_from_value() {
        let code = Value::Instructions(Arc::new(vec![Instruction::op(Opcode::Halt)]));
        let spec_map = Value::map([
            ("id", Value::str("worker")),
            ("instructions", code),
            ("restart", Value::symbol("transient")),
            ("shutdown", Value::Float(0.5)),
            ("globals", Value::map([("n", Value::Int(3))])),
        ]);
        let spec = ChildSpec::from_value(&spec_map).unwrap();
        assert_eq!(spec.id, "worker");
        assert_eq!(spec.restart, RestartPolicy::Transient);
        assert_eq!(
            spec.shutdown,
            ShutdownPolicy::Timeout(Duration::from_millis(500))
        );
        assert_eq!(spec.program.globals["n"], Value::Int(3));

        assert!(ChildSpec::from_value(&Value::Int(1)).is_err());
        assert!(ChildSpec::from_value(&Value::map([("id", Value::str("x"))])).is_err());
    }
}
