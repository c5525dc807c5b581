//! Literal push opcode handlers

use reeve_bytecode::{Instruction, Opcode, Value};

use crate::interpreter::Executor;
use crate::process::ExecState;
use crate::{VmError, VmResult};

impl Executor {
    pub(in crate::interpreter) fn exec_literal_ops(
        &self,
        exec: &mut ExecState,
        instr: &Instruction,
    ) -> VmResult<()> {
        let value = match instr.opcode {
            Opcode::PushNull => Value::Null,
            Opcode::PushTrue => Value::Bool(true),
            Opcode::PushFalse => Value::Bool(false),
            Opcode::PushInt => match &instr.operand {
                Value::Int(i) => Value::Int(*i),
                other => return Err(operand_mismatch("integer", other)),
            },
            Opcode::PushUint => match &instr.operand {
                Value::Uint(u) => Value::Uint(*u),
                other => return Err(operand_mismatch("unsigned integer", other)),
            },
            Opcode::PushFloat => match &instr.operand {
                Value::Float(f) => Value::Float(*f),
                other => return Err(operand_mismatch("float", other)),
            },
            Opcode::PushString => match &instr.operand {
                Value::Str(s) => Value::Str(s.clone()),
                other => return Err(operand_mismatch("string", other)),
            },
            // Accepts either a string or a symbol operand.
            Opcode::PushSymbol => match instr.operand.as_name() {
                Some(name) => Value::symbol(name),
                None => return Err(operand_mismatch("string or symbol", &instr.operand)),
            },
            Opcode::PushCustom => instr.operand.clone(),
            Opcode::PushInstructions => match &instr.operand {
                Value::Instructions(_) => instr.operand.clone(),
                other => return Err(operand_mismatch("instructions", other)),
            },
            other => {
                return Err(VmError::InvalidInstruction(format!(
                    "{:?} is not a literal opcode",
                    other
                )))
            }
        };
        self.push(exec, value)
    }
}

fn operand_mismatch(expected: &str, found: &Value) -> VmError {
    VmError::TypeMismatch {
        expected: format!("{} operand", expected),
        found: found.type_name().into(),
    }
}
