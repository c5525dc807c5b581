//! Comparison opcode handlers
//!
//! Equality is structural and cross-type within numerics. Ordering covers
//! numbers, strings, symbols, binaries, and arrays; comparing unlike
//! non-numeric types (or anything against a NaN) raises TypeMismatch.

use std::cmp::Ordering;

use reeve_bytecode::{Instruction, Opcode, Value};

use crate::interpreter::Executor;
use crate::process::ExecState;
use crate::{VmError, VmResult};

impl Executor {
    pub(in crate::interpreter) fn exec_comparison_ops(
        &self,
        exec: &mut ExecState,
        instr: &Instruction,
    ) -> VmResult<()> {
        let op = instr.opcode;
        let result = match op {
            Opcode::Eq => {
                let b = self.pop(exec, op)?;
                let a = self.pop(exec, op)?;
                a == b
            }
            Opcode::Ne => {
                let b = self.pop(exec, op)?;
                let a = self.pop(exec, op)?;
                a != b
            }
            Opcode::Id => {
                let b = self.pop(exec, op)?;
                let a = self.pop(exec, op)?;
                a.is_identical(&b)
            }
            Opcode::Nid => {
                let b = self.pop(exec, op)?;
                let a = self.pop(exec, op)?;
                !a.is_identical(&b)
            }
            Opcode::Lt => self.ordered(exec, op)? == Ordering::Less,
            Opcode::Le => self.ordered(exec, op)? != Ordering::Greater,
            Opcode::Gt => self.ordered(exec, op)? == Ordering::Greater,
            Opcode::Ge => self.ordered(exec, op)? != Ordering::Less,
            Opcode::IsNull => matches!(self.pop(exec, op)?, Value::Null),
            Opcode::IsNotNull => !matches!(self.pop(exec, op)?, Value::Null),
            other => {
                return Err(VmError::InvalidInstruction(format!(
                    "{:?} is not a comparison opcode",
                    other
                )))
            }
        };
        self.push(exec, Value::Bool(result))
    }

    fn ordered(&self, exec: &mut ExecState, op: Opcode) -> VmResult<Ordering> {
        let b = self.pop(exec, op)?;
        let a = self.pop(exec, op)?;
        a.compare(&b).ok_or_else(|| VmError::TypeMismatch {
            expected: format!("values comparable with {}", a.type_name()),
            found: b.type_name().into(),
        })
    }
}
