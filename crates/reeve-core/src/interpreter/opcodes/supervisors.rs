//! Supervisor opcode handlers
//!
//! These act on a supervisor address popped from the stack; the
//! supervisor process itself runs no code.

use std::sync::Arc;

use reeve_bytecode::{Instruction, Opcode, Value};

use crate::interpreter::Executor;
use crate::process::{ExecState, Process};
use crate::supervisor::ChildSpec;
use crate::{VmError, VmResult};

impl Executor {
    pub(in crate::interpreter) fn exec_supervisor_ops(
        &self,
        _proc: &Arc<Process>,
        exec: &mut ExecState,
        instr: &Instruction,
    ) -> VmResult<()> {
        let op = instr.opcode;
        match op {
            Opcode::StartChild => {
                let sup_addr = self.pop_target(exec, op)?;
                let spec_value = self.pop(exec, op)?;
                let spec = ChildSpec::from_value(&spec_value)?;
                let child = self
                    .shared()
                    .supervisors
                    .start_child(self.fault(), self.shared(), sup_addr, spec)?;
                self.push(exec, Value::Uint(child))?;
            }
            Opcode::StopChild => {
                let sup_addr = self.pop_target(exec, op)?;
                let id = self.pop_name(exec, op)?;
                let stopped = self.shared().supervisors.stop_child(
                    self.fault(),
                    self.shared(),
                    sup_addr,
                    &id,
                );
                self.push(exec, Value::Bool(stopped))?;
            }
            Opcode::RestartChild => {
                let sup_addr = self.pop_target(exec, op)?;
                let id = self.pop_name(exec, op)?;
                let restarted = self
                    .shared()
                    .supervisors
                    .restart_child(self.fault(), self.shared(), sup_addr, &id)
                    .map(Value::Uint)
                    .unwrap_or(Value::Null);
                self.push(exec, restarted)?;
            }
            Opcode::ListChildren => {
                let sup_addr = self.pop_target(exec, op)?;
                let children = self.shared().supervisors.list_children(sup_addr);
                self.push(exec, children)?;
            }
            Opcode::CountChildren => {
                let sup_addr = self.pop_target(exec, op)?;
                let counts = self.shared().supervisors.count_children(sup_addr);
                self.push(exec, counts)?;
            }
            other => {
                return Err(VmError::InvalidInstruction(format!(
                    "{:?} is not a supervisor opcode",
                    other
                )))
            }
        }
        Ok(())
    }
}
