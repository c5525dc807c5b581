//! Process opcode handlers: spawning, exits, links, monitors, registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reeve_bytecode::{Instruction, Opcode, Program, Value};

use crate::interpreter::Executor;
use crate::message::ExitReason;
use crate::process::{ExecState, Process, ProcessState, WaitPredicate};
use crate::shared::lambda_program;
use crate::{VmError, VmResult};

impl Executor {
    pub(in crate::interpreter) fn exec_process_ops(
        &self,
        proc: &Arc<Process>,
        exec: &mut ExecState,
        instr: &Instruction,
    ) -> VmResult<()> {
        let op = instr.opcode;
        match op {
            Opcode::Spawn | Opcode::SpawnLinked | Opcode::SpawnMonitored => {
                let program = self.pop_spawnable(exec, op)?;
                let child = self
                    .shared()
                    .spawn_program(&program, Some(proc.addr()), proc.priority())?;
                // Links and monitors are recorded before the child can run.
                let monitor = match op {
                    Opcode::SpawnLinked => {
                        self.shared().links.link(proc.addr(), child.addr());
                        None
                    }
                    Opcode::SpawnMonitored => {
                        Some(self.shared().links.monitor(proc.addr(), child.addr()))
                    }
                    _ => None,
                };
                self.shared().scheduler.enqueue(&child);
                self.push(exec, Value::Uint(child.addr()))?;
                if let Some(reference) = monitor {
                    self.push(exec, Value::MonitorRef(reference))?;
                }
            }
            Opcode::SelfAddr => {
                self.push(exec, Value::Uint(proc.addr()))?;
            }
            Opcode::Exit => {
                let reason = ExitReason::from_value(self.pop(exec, op)?);
                proc.set_exit_reason(reason);
                proc.set_state(ProcessState::Dead);
            }
            Opcode::ExitRemote => {
                let target = self.pop_target(exec, op)?;
                let reason = ExitReason::from_value(self.pop(exec, op)?);
                self.fault().exit_process(proc.addr(), target, reason);
            }
            Opcode::Kill => {
                let target = self.pop_target(exec, op)?;
                if let Some(victim) = self.shared().get(target) {
                    self.fault().notify_exit(&victim, ExitReason::Kill);
                }
            }
            Opcode::Sleep => {
                let seconds = seconds_operand(&instr.operand)?;
                let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
                self.shared().scheduler.wait_for_message(
                    proc,
                    WaitPredicate::Sleeping,
                    Some(deadline),
                    false,
                );
            }
            Opcode::Yield => {
                exec.yielded = true;
            }
            Opcode::Link => {
                let target_value = self.pop(exec, op)?;
                let target = self.shared().resolve_target(&target_value);
                match target.filter(|t| self.shared().is_alive(*t)) {
                    Some(target) => self.shared().links.link(proc.addr(), target),
                    None => self.invalid_link_target(proc, target_value, target),
                }
            }
            Opcode::Unlink => {
                let target_value = self.pop(exec, op)?;
                if let Some(target) = self.shared().resolve_target(&target_value) {
                    self.shared().links.unlink(proc.addr(), target);
                }
            }
            Opcode::Monitor => {
                let target_value = self.pop(exec, op)?;
                let target = self.shared().resolve_target(&target_value);
                let target_addr = target.unwrap_or(0);
                let reference = self.shared().links.monitor(proc.addr(), target_addr);
                if target.map(|t| self.shared().is_alive(t)) != Some(true) {
                    // Dead or nonexistent: deliver DOWN immediately and
                    // keep the reference out of the registry.
                    self.shared().links.demonitor(reference.id);
                    let down = crate::message::down_message(
                        &reference,
                        &ExitReason::InvalidProcess,
                    );
                    let message = self.shared().make_message(proc.addr(), down, false);
                    proc.mailbox().push(message);
                }
                self.push(exec, Value::MonitorRef(reference))?;
            }
            Opcode::Demonitor => {
                let value = self.pop(exec, op)?;
                let id = match value {
                    Value::MonitorRef(reference) => reference.id,
                    other => match other.as_address() {
                        Some(id) => id,
                        None => {
                            return Err(VmError::TypeMismatch {
                                expected: "monitor ref".into(),
                                found: other.type_name().into(),
                            })
                        }
                    },
                };
                self.shared().links.demonitor(id);
            }
            Opcode::TrapExitEnable => self.set_trap_exit(proc, true),
            Opcode::TrapExitDisable => self.set_trap_exit(proc, false),
            Opcode::IsAlive => {
                let target_value = self.pop(exec, op)?;
                let alive = self
                    .shared()
                    .resolve_target(&target_value)
                    .map(|t| self.shared().is_alive(t))
                    .unwrap_or(false);
                self.push(exec, Value::Bool(alive))?;
            }
            Opcode::GetInfo => {
                let target_value = self.pop(exec, op)?;
                let info = self
                    .shared()
                    .resolve_target(&target_value)
                    .and_then(|t| self.shared().get(t))
                    .filter(|p| p.is_alive())
                    .map(|p| p.info())
                    .unwrap_or(Value::Null);
                self.push(exec, info)?;
            }
            Opcode::Register => {
                let name = self.pop_name(exec, op)?;
                let registered = self.shared().names.register(name.clone(), proc.addr());
                if registered {
                    proc.set_registered_name(Some(name));
                }
                self.push(exec, Value::Bool(registered))?;
            }
            Opcode::Unregister => {
                let name = self.pop_name(exec, op)?;
                let removed = self.shared().names.unregister(&name);
                if removed && proc.registered_name().as_deref() == Some(&name) {
                    proc.set_registered_name(None);
                }
                self.push(exec, Value::Bool(removed))?;
            }
            Opcode::WhereIs => {
                let name = self.pop_name(exec, op)?;
                let found = self
                    .shared()
                    .names
                    .whereis(&name)
                    .map(Value::Uint)
                    .unwrap_or(Value::Null);
                self.push(exec, found)?;
            }
            Opcode::SetFlag => {
                let value = self.pop(exec, op)?;
                let name = self.pop_name(exec, op)?;
                if name == "trap_exit" {
                    self.set_trap_exit(proc, value.is_truthy());
                } else {
                    proc.set_flag(name, value);
                }
            }
            Opcode::GetFlag => {
                let name = self.pop_name(exec, op)?;
                let value = proc.flag(&name).unwrap_or(Value::Null);
                self.push(exec, value)?;
            }
            other => {
                return Err(VmError::InvalidInstruction(format!(
                    "{:?} is not a process opcode",
                    other
                )))
            }
        }
        Ok(())
    }

    /// The trap-exit flag lives both in the link registry (read by the
    /// fault handler) and in the process flags; keep them in step.
    fn set_trap_exit(&self, proc: &Arc<Process>, trapping: bool) {
        proc.set_flag("trap_exit", Value::Bool(trapping));
        self.shared().links.set_trap_exit(proc.addr(), trapping);
    }

    /// LINK against a dead or unknown target: trapping processes get a
    /// DOWN message, everyone else dies with InvalidProcess.
    fn invalid_link_target(
        &self,
        proc: &Arc<Process>,
        target_value: Value,
        target: Option<u64>,
    ) {
        if self.shared().links.traps_exit(proc.addr()) {
            let process = target.map(Value::Uint).unwrap_or(target_value);
            let down = Value::map([
                ("signal", Value::str("DOWN")),
                ("ref", Value::Null),
                ("process", process),
                ("reason", ExitReason::InvalidProcess.to_value()),
            ]);
            let message = self.shared().make_message(proc.addr(), down, false);
            proc.mailbox().push(message);
        } else {
            proc.set_exit_reason(ExitReason::InvalidProcess);
            proc.set_state(ProcessState::Dead);
        }
    }

    fn pop_spawnable(&self, exec: &mut ExecState, op: Opcode) -> VmResult<Program> {
        match self.pop(exec, op)? {
            Value::Instructions(code) => Ok(Program::new(code.as_ref().clone())),
            Value::Lambda(lambda) => Ok(lambda_program(&lambda)),
            other => Err(VmError::TypeMismatch {
                expected: "instructions or lambda".into(),
                found: other.type_name().into(),
            }),
        }
    }

    pub(in crate::interpreter) fn pop_target(
        &self,
        exec: &mut ExecState,
        op: Opcode,
    ) -> VmResult<u64> {
        let value = self.pop(exec, op)?;
        self.shared()
            .resolve_target(&value)
            .ok_or_else(|| VmError::InvalidAddress(value.to_string()))
    }

    pub(in crate::interpreter) fn pop_name(
        &self,
        exec: &mut ExecState,
        op: Opcode,
    ) -> VmResult<String> {
        let value = self.pop(exec, op)?;
        value
            .as_name()
            .map(str::to_string)
            .ok_or_else(|| VmError::TypeMismatch {
                expected: "name".into(),
                found: value.type_name().into(),
            })
    }
}

fn seconds_operand(operand: &Value) -> VmResult<f64> {
    operand.as_f64().ok_or_else(|| VmError::TypeMismatch {
        expected: "seconds".into(),
        found: operand.type_name().into(),
    })
}
