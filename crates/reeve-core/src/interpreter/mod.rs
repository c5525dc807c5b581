//! Instruction executor
//!
//! One dispatch routine per opcode family, routed by [`Opcode::family`].
//! `execute` is the single entry point: it applies the program-counter
//! policy (pre-increment everywhere except absolute jumps), consults the
//! custom-handler table, and funnels every error (host panics included)
//! through the exception machinery: unwind to the nearest handler frame or
//! kill the process with an Exception reason and a crash dump.

pub mod builtins;
pub mod handlers;
mod opcodes;

pub use builtins::BuiltinRegistry;
pub use handlers::{HandlerTable, OpcodeHandler};

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use reeve_bytecode::{Instruction, Lambda, Opcode, Value};

use crate::fault::FaultHandler;
use crate::dump::CrashDump;
use crate::message::ExitReason;
use crate::process::{Addr, EnvSave, ExecState, Process, ProcessState};
use crate::shared::VmShared;
use crate::{VmError, VmResult};

/// Hard cap on reductions inside one inline lambda invocation.
const INLINE_REDUCTION_LIMIT: u64 = 1 << 20;

/// The instruction executor. Cheap to construct; all state lives in the
/// shared structures and the process being executed.
pub struct Executor {
    shared: Arc<VmShared>,
    fault: Arc<FaultHandler>,
    /// Built-in function registry for CALL_BUILT_IN.
    pub builtins: BuiltinRegistry,
    /// Per-opcode overrides consulted before the built-in dispatch.
    pub handlers: HandlerTable,
}

impl Executor {
    /// Create an executor over shared state, with the default builtins.
    pub fn new(shared: Arc<VmShared>, fault: Arc<FaultHandler>) -> Self {
        Self {
            shared,
            fault,
            builtins: BuiltinRegistry::with_defaults(),
            handlers: HandlerTable::new(),
        }
    }

    /// The shared state this executor operates on.
    pub fn shared(&self) -> &Arc<VmShared> {
        &self.shared
    }

    /// The fault handler used for process deaths.
    pub fn fault(&self) -> &Arc<FaultHandler> {
        &self.fault
    }

    /// Execute one instruction on a process. A non-Alive process is a
    /// no-op. Side effects land on the process; the return value is the
    /// evaluator's result and is Null for every built-in opcode.
    pub fn execute(&self, proc: &Arc<Process>, exec: &mut ExecState, instr: &Instruction) -> Value {
        if proc.state() != ProcessState::Alive {
            return Value::Null;
        }

        if let Some(handler) = self.handlers.get(instr.opcode) {
            if let Err(err) = handler(proc, exec, instr) {
                self.raise(proc, exec, err);
            }
            return Value::Null;
        }

        if instr.opcode.pre_increments() {
            exec.ip += 1;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(proc, exec, instr)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.raise(proc, exec, err),
            Err(payload) => {
                let message = panic_message(&payload);
                self.raise(proc, exec, VmError::Unhandled(message));
            }
        }
        Value::Null
    }

    fn dispatch(
        &self,
        proc: &Arc<Process>,
        exec: &mut ExecState,
        instr: &Instruction,
    ) -> VmResult<()> {
        use reeve_bytecode::opcode::Family;
        match instr.opcode.family() {
            Family::Stack => self.exec_stack_ops(exec, instr),
            Family::Literal => self.exec_literal_ops(exec, instr),
            Family::Arithmetic => self.exec_arithmetic_ops(exec, instr),
            Family::Bitwise => self.exec_bitwise_ops(exec, instr),
            Family::Logical => self.exec_logical_ops(exec, instr),
            Family::Comparison => self.exec_comparison_ops(exec, instr),
            Family::Variable => self.exec_variable_ops(exec, instr),
            Family::Control => self.exec_control_ops(proc, exec, instr),
            Family::Lambda => self.exec_lambda_ops(proc, exec, instr),
            Family::Process => self.exec_process_ops(proc, exec, instr),
            Family::Message => self.exec_message_ops(proc, exec, instr),
            Family::Supervisor => self.exec_supervisor_ops(proc, exec, instr),
            Family::Exception => self.exec_exception_ops(proc, exec, instr),
        }
    }

    // ========================================================================
    // Stack helpers
    // ========================================================================

    pub(crate) fn push(&self, exec: &mut ExecState, value: Value) -> VmResult<()> {
        if exec.stack.len() >= self.shared.config.max_stack_size {
            return Err(VmError::StackOverflow {
                limit: self.shared.config.max_stack_size,
            });
        }
        exec.stack.push(value);
        Ok(())
    }

    pub(crate) fn pop(&self, exec: &mut ExecState, op: Opcode) -> VmResult<Value> {
        exec.stack
            .pop()
            .ok_or_else(|| VmError::StackUnderflow(format!("{:?}", op)))
    }

    pub(crate) fn require_depth(&self, exec: &ExecState, n: usize, op: Opcode) -> VmResult<()> {
        if exec.stack.len() < n {
            return Err(VmError::StackUnderflow(format!("{:?}", op)));
        }
        Ok(())
    }

    /// Pop `n` values, restoring stack order (first pushed first).
    pub(crate) fn pop_args(
        &self,
        exec: &mut ExecState,
        n: usize,
        op: Opcode,
    ) -> VmResult<Vec<Value>> {
        self.require_depth(exec, n, op)?;
        let mut args: Vec<Value> = Vec::with_capacity(n);
        for _ in 0..n {
            args.push(exec.stack.pop().expect("depth checked"));
        }
        args.reverse();
        Ok(args)
    }

    // ========================================================================
    // Exceptions
    // ========================================================================

    /// Route a VmError through the exception machinery.
    pub(crate) fn raise(&self, proc: &Arc<Process>, exec: &mut ExecState, err: VmError) {
        let exception = self.exception_from_error(proc.addr(), exec, &err);
        self.throw_value(proc, exec, exception);
    }

    /// Unwind to the nearest handler, or kill the process with reason
    /// Exception and append a crash dump.
    pub(crate) fn throw_value(&self, proc: &Arc<Process>, exec: &mut ExecState, exception: Value) {
        if exec.handlers.is_empty() {
            let dump = CrashDump::new(
                proc.addr(),
                proc.registered_name(),
                exception.clone(),
                exec.ip,
                exec.call_stack.len(),
                &exec.stack,
            );
            self.shared.crash_store.record(dump);
            proc.set_exit_reason(ExitReason::Exception(exception));
            proc.set_state(ProcessState::Dead);
        } else {
            self.unwind_to_handler(exec, exception);
        }
    }

    fn unwind_to_handler(&self, exec: &mut ExecState, exception: Value) {
        let frame = exec.handlers.pop().expect("caller checked handlers");

        // Undo lambda environment splices made above the handler.
        while exec.env_saves.len() > frame.env_depth {
            let save = exec.env_saves.pop().expect("depth checked");
            restore_env(exec, save);
        }

        // Restore the code block active when the handler was installed.
        // The saved-code depth is tracked in the frame so unwinding across
        // indirect calls keeps the two stacks in step.
        if exec.saved_code.len() > frame.saved_code_depth {
            exec.code = Arc::clone(&exec.saved_code[frame.saved_code_depth]);
            exec.saved_code.truncate(frame.saved_code_depth);
        }
        exec.call_stack.truncate(frame.call_depth);
        exec.stack.truncate(frame.stack_depth);
        exec.locals.truncate(frame.locals_depth);
        exec.frame_pointer = frame.frame_pointer;

        exec.stack.push(exception.clone());
        exec.current_exception = Some(exception);
        exec.ip = frame.catch_addr;
    }

    /// Build a structured exception value from a host-level error.
    pub(crate) fn exception_from_error(
        &self,
        addr: Addr,
        exec: &ExecState,
        err: &VmError,
    ) -> Value {
        Value::map([
            ("type", Value::symbol("exception")),
            ("message", Value::str(err.to_string())),
            ("error", Value::symbol(err.kind_name())),
            ("stacktrace", self.build_stacktrace(exec)),
            ("process", Value::Uint(addr)),
            ("counter", Value::Uint(exec.ip as u64)),
        ])
    }

    /// Wrap a user-thrown value into the structured exception shape,
    /// unless it already is one.
    pub(crate) fn shape_exception(&self, addr: Addr, exec: &ExecState, raw: Value) -> Value {
        if let Value::Map(map) = &raw {
            if map.get("type") == Some(&Value::symbol("exception")) {
                return raw;
            }
        }
        let message = match &raw {
            Value::Str(s) => s.clone(),
            Value::Map(map) => match map.get("message") {
                Some(Value::Str(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => raw.to_string(),
            },
            other => other.to_string(),
        };
        Value::map([
            ("type", Value::symbol("exception")),
            ("message", Value::str(message)),
            ("error", raw),
            ("stacktrace", self.build_stacktrace(exec)),
            ("process", Value::Uint(addr)),
            ("counter", Value::Uint(exec.ip as u64)),
        ])
    }

    /// Frame maps for the current counter and every call record,
    /// innermost first: `{address, instruction[, function]}`.
    pub(crate) fn build_stacktrace(&self, exec: &ExecState) -> Value {
        let mut frames = Vec::new();
        let mut push_frame = |address: usize, code: &[Instruction]| {
            let mut entries = vec![("address".to_string(), Value::Uint(address as u64))];
            // An unwound frame's address is usually one past the faulting
            // instruction; name the one before it when out of range.
            let shown = address.min(code.len().saturating_sub(1));
            if let Some(instr) = code.get(shown) {
                entries.push((
                    "instruction".to_string(),
                    Value::str(format!("{:?}", instr.opcode)),
                ));
            }
            if let Some(name) = subroutine_at(exec, address) {
                entries.push(("function".to_string(), Value::str(name)));
            }
            frames.push(Value::Map(entries.into_iter().collect()));
        };

        push_frame(exec.ip, &exec.code);
        // Call records pair with saved_code in lock-step: the return
        // address of call_stack[i] points into saved_code[i].
        for (frame, code) in exec
            .call_stack
            .iter()
            .zip(exec.saved_code.iter())
            .rev()
        {
            push_frame(frame.return_ip, code);
        }
        Value::Array(frames)
    }

    // ========================================================================
    // Inline lambda invocation
    // ========================================================================

    /// Run a lambda to completion inside the current slice, as used by
    /// LAMBDA_INVOKE and the selective-receive matcher. The execution
    /// state is snapshotted and restored around the call; suspension
    /// inside the inline frame is refused.
    pub(crate) fn invoke_lambda_inline(
        &self,
        proc: &Arc<Process>,
        exec: &mut ExecState,
        lambda: &Lambda,
        args: Vec<Value>,
    ) -> VmResult<Value> {
        let saved_ip = exec.ip;
        let saved_code = Arc::clone(&exec.code);
        let saved_fp = exec.frame_pointer;
        let saved_locals = exec.locals.len();
        let saved_closure = exec.current_closure.take();
        let base_stack = exec.stack.len();
        let base_calls = exec.call_stack.len();
        let base_saved_code = exec.saved_code.len();
        let base_handlers = exec.handlers.len();
        let base_env = exec.env_saves.len();

        // Bind arguments: bound-first, then the given args, padded with
        // nulls up to the parameter count.
        exec.frame_pointer = saved_locals;
        exec.locals.extend(lambda.bound.iter().cloned());
        exec.locals.extend(args);
        let bound_count = exec.locals.len() - saved_locals;
        if bound_count < lambda.params.len() {
            let missing = lambda.params.len() - bound_count;
            exec.locals
                .extend(std::iter::repeat(Value::Null).take(missing));
        }

        // Splice the captured environment into globals.
        let mut displaced = Vec::with_capacity(lambda.captured.len());
        for (name, value) in &lambda.captured {
            displaced.push((name.clone(), exec.globals.insert(name.clone(), value.clone())));
        }

        exec.code = Arc::clone(&lambda.code);
        exec.ip = 0;
        exec.current_closure = Some(lambda.clone());

        let restore = |exec: &mut ExecState| {
            exec.stack.truncate(base_stack);
            exec.call_stack.truncate(base_calls);
            exec.saved_code.truncate(base_saved_code);
            exec.handlers.truncate(base_handlers);
            while exec.env_saves.len() > base_env {
                let save = exec.env_saves.pop().expect("depth checked");
                restore_env(exec, save);
            }
            exec.locals.truncate(saved_locals);
            exec.frame_pointer = saved_fp;
            exec.code = saved_code.clone();
            exec.ip = saved_ip;
            exec.current_closure = saved_closure.clone();
        };
        let restore_displaced = |exec: &mut ExecState, displaced: Vec<(String, Option<Value>)>| {
            for (name, old) in displaced.into_iter().rev() {
                match old {
                    Some(value) => exec.globals.insert(name, value),
                    None => exec.globals.remove(&name),
                };
            }
        };

        let mut reductions = 0u64;
        let result = loop {
            if reductions >= INLINE_REDUCTION_LIMIT {
                restore(exec);
                restore_displaced(exec, displaced);
                return Err(VmError::Runtime(
                    "inline lambda exceeded its reduction budget".into(),
                ));
            }
            reductions += 1;

            if exec.ip >= exec.code.len() {
                break self.take_inline_result(exec, base_stack);
            }
            let instr = exec.code[exec.ip].clone();
            if matches!(instr.opcode, Opcode::Return | Opcode::ReturnValue)
                && exec.call_stack.len() == base_calls
            {
                break self.take_inline_result(exec, base_stack);
            }

            if instr.opcode.pre_increments() {
                exec.ip += 1;
            }
            match self.dispatch(proc, exec, &instr) {
                Ok(()) => {}
                Err(err) => {
                    if exec.handlers.len() > base_handlers {
                        let exception = self.exception_from_error(proc.addr(), exec, &err);
                        self.unwind_to_handler(exec, exception);
                        continue;
                    }
                    restore(exec);
                    restore_displaced(exec, displaced);
                    return Err(err);
                }
            }

            match proc.state() {
                ProcessState::Alive => {}
                ProcessState::Waiting | ProcessState::Blocked => {
                    self.shared.scheduler.cancel_park(proc);
                    restore(exec);
                    restore_displaced(exec, displaced);
                    return Err(VmError::Runtime(
                        "cannot suspend inside an inline lambda".into(),
                    ));
                }
                ProcessState::Stale | ProcessState::Dead => {
                    // The lambda terminated the process; stop quietly and
                    // let the slice loop observe the state.
                    break Value::Null;
                }
            }
        };

        restore(exec);
        restore_displaced(exec, displaced);
        Ok(result)
    }

    fn take_inline_result(&self, exec: &mut ExecState, base_stack: usize) -> Value {
        if exec.stack.len() > base_stack {
            exec.stack.pop().expect("depth checked")
        } else {
            Value::Null
        }
    }
}

/// Restore one displaced-environment record.
fn restore_env(exec: &mut ExecState, save: EnvSave) {
    for (name, old) in save.saved.into_iter().rev() {
        match old {
            Some(value) => exec.globals.insert(name, value),
            None => exec.globals.remove(&name),
        };
    }
    exec.current_closure = save.prev_closure;
}

/// The innermost subroutine whose start address covers `address`.
fn subroutine_at(exec: &ExecState, address: usize) -> Option<String> {
    exec.subroutines
        .iter()
        .filter(|(_, entry)| entry.start <= address)
        .max_by_key(|(_, entry)| entry.start)
        .map(|(name, _)| name.clone())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "host panic".to_string()
    }
}
