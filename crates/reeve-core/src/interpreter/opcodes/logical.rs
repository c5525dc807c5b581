//! Logical opcode handlers
//!
//! Operands coerce through truthiness; results are booleans.

use reeve_bytecode::{Instruction, Opcode, Value};

use crate::interpreter::Executor;
use crate::process::ExecState;
use crate::{VmError, VmResult};

impl Executor {
    pub(in crate::interpreter) fn exec_logical_ops(
        &self,
        exec: &mut ExecState,
        instr: &Instruction,
    ) -> VmResult<()> {
        let op = instr.opcode;
        let result = match op {
            Opcode::And => {
                let b = self.pop(exec, op)?.is_truthy();
                let a = self.pop(exec, op)?.is_truthy();
                a && b
            }
            Opcode::Or => {
                let b = self.pop(exec, op)?.is_truthy();
                let a = self.pop(exec, op)?.is_truthy();
                a || b
            }
            Opcode::Xor => {
                let b = self.pop(exec, op)?.is_truthy();
                let a = self.pop(exec, op)?.is_truthy();
                a != b
            }
            Opcode::Not => !self.pop(exec, op)?.is_truthy(),
            other => {
                return Err(VmError::InvalidInstruction(format!(
                    "{:?} is not a logical opcode",
                    other
                )))
            }
        };
        self.push(exec, Value::Bool(result))
    }
}
