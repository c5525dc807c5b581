//! Control-flow opcode handlers
//!
//! Call records and the saved-code stack are pushed in lock-step for
//! every call form, so `call_stack.len() == saved_code.len()` always
//! holds and RETURN can restore the caller's code block unconditionally.

use std::sync::Arc;

use reeve_bytecode::{Instruction, Lambda, Opcode, Value};

use crate::interpreter::Executor;
use crate::message::ExitReason;
use crate::process::{CallFrame, EnvSave, ExecState, Process, ProcessState};
use crate::{VmError, VmResult};

impl Executor {
    pub(in crate::interpreter) fn exec_control_ops(
        &self,
        proc: &Arc<Process>,
        exec: &mut ExecState,
        instr: &Instruction,
    ) -> VmResult<()> {
        let op = instr.opcode;
        match op {
            // The one opcode that sets the counter directly.
            Opcode::Jump => {
                exec.ip = validate_target(exec, absolute_target(&instr.operand)?)?;
            }
            Opcode::JumpFwd => {
                let offset = relative_offset(&instr.operand)?;
                exec.ip = validate_target(exec, exec.ip as i64 + offset)?;
            }
            Opcode::JumpBwd => {
                let offset = relative_offset(&instr.operand)?;
                exec.ip = validate_target(exec, exec.ip as i64 - offset)?;
            }
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                let condition = self.pop(exec, op)?.is_truthy();
                let take = if op == Opcode::JumpIfTrue {
                    condition
                } else {
                    !condition
                };
                if take {
                    exec.ip = validate_target(exec, absolute_target(&instr.operand)?)?;
                }
            }
            Opcode::JumpIfTruePeek | Opcode::JumpIfFalsePeek => {
                self.require_depth(exec, 1, op)?;
                let condition = exec.stack.last().expect("depth checked").is_truthy();
                let take = if op == Opcode::JumpIfTruePeek {
                    condition
                } else {
                    !condition
                };
                if take {
                    exec.ip = validate_target(exec, absolute_target(&instr.operand)?)?;
                }
            }
            Opcode::Call => {
                let name = instr.operand.as_name().ok_or_else(|| VmError::TypeMismatch {
                    expected: "subroutine name".into(),
                    found: instr.operand.type_name().into(),
                })?;
                self.call_subroutine(exec, name)?;
            }
            Opcode::CallDynamic => {
                let value = self.pop(exec, op)?;
                let name = value.as_name().ok_or_else(|| VmError::TypeMismatch {
                    expected: "subroutine name".into(),
                    found: value.type_name().into(),
                })?;
                self.call_subroutine(exec, name)?;
            }
            Opcode::CallIndirect => {
                let callee = self.pop(exec, op)?;
                match callee {
                    Value::Instructions(code) => {
                        push_call(exec);
                        exec.frame_pointer = exec.locals.len();
                        exec.code = code;
                        exec.ip = 0;
                    }
                    Value::Lambda(lambda) => self.call_lambda_indirect(exec, *lambda),
                    other => {
                        return Err(VmError::TypeMismatch {
                            expected: "instructions or lambda".into(),
                            found: other.type_name().into(),
                        })
                    }
                }
            }
            Opcode::CallBuiltIn => {
                let (module, function, arity) = builtin_key(&instr.operand)?;
                let args = self.pop_args(exec, arity, op)?;
                let result = self.builtins.call(&module, &function, &args)?;
                self.push(exec, result)?;
            }
            Opcode::Return => {
                self.do_return(proc, exec, None)?;
            }
            Opcode::ReturnValue => {
                let value = self.pop(exec, op)?;
                self.do_return(proc, exec, Some(value))?;
            }
            Opcode::Halt => {
                proc.set_exit_reason(ExitReason::Normal);
                proc.set_state(ProcessState::Dead);
            }
            Opcode::Nop => {}
            other => {
                return Err(VmError::InvalidInstruction(format!(
                    "{:?} is not a control opcode",
                    other
                )))
            }
        }
        Ok(())
    }

    fn call_subroutine(&self, exec: &mut ExecState, name: &str) -> VmResult<()> {
        let entry = exec
            .subroutines
            .get(name)
            .copied()
            .ok_or_else(|| VmError::UndefinedSubroutine(name.to_string()))?;
        push_call(exec);
        exec.frame_pointer = exec.locals.len();
        exec.ip = entry.start;
        Ok(())
    }

    fn call_lambda_indirect(&self, exec: &mut ExecState, lambda: Lambda) {
        push_call(exec);
        exec.frame_pointer = exec.locals.len();

        // Splice the captured environment into globals, remembering what
        // it displaced so RETURN can undo the splice.
        let mut saved = Vec::with_capacity(lambda.captured.len());
        for (name, value) in &lambda.captured {
            saved.push((name.clone(), exec.globals.insert(name.clone(), value.clone())));
        }
        exec.env_saves.push(EnvSave {
            call_depth: exec.call_stack.len(),
            saved,
            prev_closure: exec.current_closure.take(),
        });

        exec.code = Arc::clone(&lambda.code);
        exec.current_closure = Some(lambda);
        exec.ip = 0;
    }

    fn do_return(
        &self,
        proc: &Arc<Process>,
        exec: &mut ExecState,
        value: Option<Value>,
    ) -> VmResult<()> {
        let Some(frame) = exec.call_stack.pop() else {
            // Returning from the outermost frame terminates cleanly.
            proc.set_exit_reason(ExitReason::Normal);
            proc.set_state(ProcessState::Dead);
            return Ok(());
        };
        let code = exec
            .saved_code
            .pop()
            .ok_or_else(|| VmError::Runtime("call stack out of step with saved code".into()))?;

        // Undo a lambda environment splice made by this call, if any.
        if exec
            .env_saves
            .last()
            .map(|save| save.call_depth == exec.call_stack.len() + 1)
            .unwrap_or(false)
        {
            let save = exec.env_saves.pop().expect("checked above");
            for (name, old) in save.saved.into_iter().rev() {
                match old {
                    Some(v) => exec.globals.insert(name, v),
                    None => exec.globals.remove(&name),
                };
            }
            exec.current_closure = save.prev_closure;
        }

        exec.code = code;
        exec.locals.truncate(frame.saved_locals);
        exec.frame_pointer = frame.saved_fp;
        exec.ip = frame.return_ip;
        if let Some(value) = value {
            exec.stack.push(value);
        }
        Ok(())
    }
}

/// Record a call frame returning to the current (already incremented)
/// counter, paired with a saved-code entry in lock-step.
fn push_call(exec: &mut ExecState) {
    exec.call_stack.push(CallFrame {
        return_ip: exec.ip,
        saved_fp: exec.frame_pointer,
        saved_locals: exec.locals.len(),
    });
    exec.saved_code.push(Arc::clone(&exec.code));
}

fn absolute_target(operand: &Value) -> VmResult<i64> {
    match operand {
        Value::Int(i) => Ok(*i),
        Value::Uint(u) => Ok(*u as i64),
        other => Err(VmError::TypeMismatch {
            expected: "jump target".into(),
            found: other.type_name().into(),
        }),
    }
}

fn relative_offset(operand: &Value) -> VmResult<i64> {
    match operand {
        Value::Int(i) if *i >= 0 => Ok(*i),
        Value::Uint(u) => Ok(*u as i64),
        Value::Int(_) => Err(VmError::Value("jump offset must be non-negative".into())),
        other => Err(VmError::TypeMismatch {
            expected: "jump offset".into(),
            found: other.type_name().into(),
        }),
    }
}

fn validate_target(exec: &ExecState, target: i64) -> VmResult<usize> {
    if target < 0 || target as usize >= exec.code.len() {
        return Err(VmError::InvalidJumpTarget {
            target,
            len: exec.code.len(),
        });
    }
    Ok(target as usize)
}

/// CALL_BUILT_IN operand: `[module, function, arity]`.
fn builtin_key(operand: &Value) -> VmResult<(String, String, usize)> {
    let Value::Array(parts) = operand else {
        return Err(VmError::TypeMismatch {
            expected: "[module, function, arity]".into(),
            found: operand.type_name().into(),
        });
    };
    let module = parts
        .first()
        .and_then(|v| v.as_name())
        .ok_or_else(|| VmError::Value("built-in call is missing a module".into()))?;
    let function = parts
        .get(1)
        .and_then(|v| v.as_name())
        .ok_or_else(|| VmError::Value("built-in call is missing a function".into()))?;
    let arity = parts
        .get(2)
        .and_then(|v| v.as_address())
        .ok_or_else(|| VmError::Value("built-in call is missing an arity".into()))?;
    Ok((module.to_string(), function.to_string(), arity as usize))
}
