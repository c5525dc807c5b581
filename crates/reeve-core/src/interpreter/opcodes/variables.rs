//! Variable opcode handlers
//!
//! Locals are addressed relative to the frame pointer. Loading an unset
//! slot raises UndefinedVariable; storing past the end extends the locals
//! with null fill. Upvalues require an active closure.

use reeve_bytecode::{Instruction, Opcode, Value};

use crate::interpreter::Executor;
use crate::process::ExecState;
use crate::{VmError, VmResult};

impl Executor {
    pub(in crate::interpreter) fn exec_variable_ops(
        &self,
        exec: &mut ExecState,
        instr: &Instruction,
    ) -> VmResult<()> {
        let op = instr.opcode;
        match op {
            Opcode::LoadLocal => {
                let slot = slot_index(&instr.operand)?;
                let index = exec.frame_pointer + slot;
                let value = exec
                    .locals
                    .get(index)
                    .cloned()
                    .ok_or_else(|| VmError::UndefinedVariable(format!("local {}", slot)))?;
                self.push(exec, value)?;
            }
            Opcode::StoreLocal => {
                let slot = slot_index(&instr.operand)?;
                let value = self.pop(exec, op)?;
                let index = exec.frame_pointer + slot;
                if index >= exec.locals.len() {
                    exec.locals.resize(index + 1, Value::Null);
                }
                exec.locals[index] = value;
            }
            Opcode::LoadGlobal => {
                let name = global_name(&instr.operand)?;
                let value = exec
                    .globals
                    .get(name)
                    .cloned()
                    .ok_or_else(|| VmError::UndefinedVariable(name.to_string()))?;
                self.push(exec, value)?;
            }
            Opcode::StoreGlobal => {
                let name = global_name(&instr.operand)?.to_string();
                let value = self.pop(exec, op)?;
                exec.globals.insert(name, value);
            }
            Opcode::LoadUpvalue => {
                let index = slot_index(&instr.operand)?;
                let closure = exec.current_closure.as_ref().ok_or_else(|| {
                    VmError::Runtime("upvalue access outside a closure".into())
                })?;
                let value = closure
                    .upvalues
                    .get(index)
                    .cloned()
                    .ok_or_else(|| VmError::UndefinedVariable(format!("upvalue {}", index)))?;
                self.push(exec, value)?;
            }
            Opcode::StoreUpvalue => {
                let index = slot_index(&instr.operand)?;
                let value = self.pop(exec, op)?;
                let closure = exec.current_closure.as_mut().ok_or_else(|| {
                    VmError::Runtime("upvalue access outside a closure".into())
                })?;
                if index >= closure.upvalues.len() {
                    closure.upvalues.resize(index + 1, Value::Null);
                }
                closure.upvalues[index] = value;
            }
            other => {
                return Err(VmError::InvalidInstruction(format!(
                    "{:?} is not a variable opcode",
                    other
                )))
            }
        }
        Ok(())
    }
}

fn slot_index(operand: &Value) -> VmResult<usize> {
    match operand {
        Value::Int(i) if *i >= 0 => Ok(*i as usize),
        Value::Uint(u) => Ok(*u as usize),
        other => Err(VmError::TypeMismatch {
            expected: "non-negative slot index".into(),
            found: other.type_name().into(),
        }),
    }
}

fn global_name(operand: &Value) -> VmResult<&str> {
    operand.as_name().ok_or_else(|| VmError::TypeMismatch {
        expected: "variable name".into(),
        found: operand.type_name().into(),
    })
}
