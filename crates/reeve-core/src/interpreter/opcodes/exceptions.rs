//! Exception opcode handlers: TryBegin, TryEnd, Throw, Rethrow, Catch,
//! GetStacktrace.

use std::sync::Arc;

use reeve_bytecode::{Instruction, Opcode, Value};

use crate::interpreter::Executor;
use crate::process::{ExecState, HandlerFrame, Process};
use crate::{VmError, VmResult};

impl Executor {
    pub(in crate::interpreter) fn exec_exception_ops(
        &self,
        proc: &Arc<Process>,
        exec: &mut ExecState,
        instr: &Instruction,
    ) -> VmResult<()> {
        let op = instr.opcode;
        match op {
            Opcode::TryBegin => {
                let offset = match &instr.operand {
                    Value::Int(i) if *i >= 0 => *i as usize,
                    Value::Uint(u) => *u as usize,
                    other => {
                        return Err(VmError::TypeMismatch {
                            expected: "catch offset".into(),
                            found: other.type_name().into(),
                        })
                    }
                };
                // The counter is already past TRY_BEGIN.
                let catch_addr = exec.ip + offset;
                if catch_addr >= exec.code.len() {
                    return Err(VmError::InvalidJumpTarget {
                        target: catch_addr as i64,
                        len: exec.code.len(),
                    });
                }
                exec.handlers.push(HandlerFrame {
                    catch_addr,
                    stack_depth: exec.stack.len(),
                    call_depth: exec.call_stack.len(),
                    saved_code_depth: exec.saved_code.len(),
                    env_depth: exec.env_saves.len(),
                    locals_depth: exec.locals.len(),
                    frame_pointer: exec.frame_pointer,
                });
            }
            Opcode::TryEnd => {
                if exec.handlers.pop().is_none() {
                    return Err(VmError::Runtime("TRY_END without an open handler".into()));
                }
            }
            Opcode::Throw => {
                let raw = self.pop(exec, op)?;
                let exception = self.shape_exception(proc.addr(), exec, raw);
                self.throw_value(proc, exec, exception);
            }
            Opcode::Rethrow => match exec.current_exception.clone() {
                Some(exception) => self.throw_value(proc, exec, exception),
                None => {
                    return Err(VmError::Runtime("RETHROW with no active exception".into()))
                }
            },
            Opcode::Catch => {
                self.require_depth(exec, 1, op)?;
                let top = exec.stack.last().expect("depth checked").clone();
                exec.current_exception = Some(top);
            }
            Opcode::GetStacktrace => {
                let trace = self.build_stacktrace(exec);
                self.push(exec, trace)?;
            }
            other => {
                return Err(VmError::InvalidInstruction(format!(
                    "{:?} is not an exception opcode",
                    other
                )))
            }
        }
        Ok(())
    }
}
