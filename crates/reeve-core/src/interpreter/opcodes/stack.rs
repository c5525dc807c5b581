//! Stack manipulation opcode handlers

use reeve_bytecode::{Instruction, Opcode, Value};

use crate::interpreter::Executor;
use crate::process::ExecState;
use crate::{VmError, VmResult};

impl Executor {
    pub(in crate::interpreter) fn exec_stack_ops(
        &self,
        exec: &mut ExecState,
        instr: &Instruction,
    ) -> VmResult<()> {
        let op = instr.opcode;
        match op {
            Opcode::Pop => {
                self.pop(exec, op)?;
            }
            Opcode::Dup => {
                self.require_depth(exec, 1, op)?;
                let top = exec.stack.last().expect("depth checked").clone();
                self.push(exec, top)?;
            }
            Opcode::Dup2 => {
                self.require_depth(exec, 2, op)?;
                let len = exec.stack.len();
                let a = exec.stack[len - 2].clone();
                let b = exec.stack[len - 1].clone();
                self.push(exec, a)?;
                self.push(exec, b)?;
            }
            Opcode::Over => {
                self.require_depth(exec, 2, op)?;
                let second = exec.stack[exec.stack.len() - 2].clone();
                self.push(exec, second)?;
            }
            Opcode::Swap => {
                self.require_depth(exec, 2, op)?;
                let len = exec.stack.len();
                exec.stack.swap(len - 1, len - 2);
            }
            Opcode::RotUp => {
                self.require_depth(exec, 3, op)?;
                let len = exec.stack.len();
                let third = exec.stack.remove(len - 3);
                exec.stack.push(third);
            }
            Opcode::RotDown => {
                self.require_depth(exec, 3, op)?;
                let top = exec.stack.pop().expect("depth checked");
                let len = exec.stack.len();
                exec.stack.insert(len - 2, top);
            }
            Opcode::Nip => {
                self.require_depth(exec, 2, op)?;
                let len = exec.stack.len();
                exec.stack.remove(len - 2);
            }
            Opcode::Tuck => {
                self.require_depth(exec, 2, op)?;
                let top = exec.stack.last().expect("depth checked").clone();
                let len = exec.stack.len();
                if exec.stack.len() >= self.shared().config.max_stack_size {
                    return Err(VmError::StackOverflow {
                        limit: self.shared().config.max_stack_size,
                    });
                }
                exec.stack.insert(len - 2, top);
            }
            Opcode::Depth => {
                let depth = exec.stack.len() as u64;
                self.push(exec, Value::Uint(depth))?;
            }
            Opcode::Pick => {
                let n = pick_index(&instr.operand)?;
                self.require_depth(exec, n + 1, op)?;
                let value = exec.stack[exec.stack.len() - 1 - n].clone();
                self.push(exec, value)?;
            }
            Opcode::Roll => {
                let n = pick_index(&instr.operand)?;
                self.require_depth(exec, n + 1, op)?;
                let index = exec.stack.len() - 1 - n;
                let value = exec.stack.remove(index);
                exec.stack.push(value);
            }
            other => {
                return Err(VmError::InvalidInstruction(format!(
                    "{:?} is not a stack opcode",
                    other
                )))
            }
        }
        Ok(())
    }
}

/// PICK/ROLL depth operand: a non-negative integer.
fn pick_index(operand: &Value) -> VmResult<usize> {
    match operand {
        Value::Int(n) if *n >= 0 => Ok(*n as usize),
        Value::Uint(n) => Ok(*n as usize),
        Value::Int(_) => Err(VmError::Value("depth must be non-negative".into())),
        other => Err(VmError::TypeMismatch {
            expected: "integer depth".into(),
            found: other.type_name().into(),
        }),
    }
}
