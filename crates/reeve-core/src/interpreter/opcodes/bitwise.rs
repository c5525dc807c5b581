//! Bitwise opcode handlers
//!
//! Integer operands only. Shifts of 64 bits or more saturate: zero for
//! left and logical-right shifts, sign-fill for arithmetic right shifts
//! on signed values.

use reeve_bytecode::{Instruction, Opcode, Value};

use crate::interpreter::Executor;
use crate::process::ExecState;
use crate::{VmError, VmResult};

impl Executor {
    pub(in crate::interpreter) fn exec_bitwise_ops(
        &self,
        exec: &mut ExecState,
        instr: &Instruction,
    ) -> VmResult<()> {
        let op = instr.opcode;
        let result = match op {
            Opcode::BitAnd => self.bit_binary(exec, op, |a, b| a & b)?,
            Opcode::BitOr => self.bit_binary(exec, op, |a, b| a | b)?,
            Opcode::BitXor => self.bit_binary(exec, op, |a, b| a ^ b)?,
            Opcode::BitNot => match self.pop_integer(exec, op)? {
                Value::Int(a) => Value::Int(!a),
                Value::Uint(a) => Value::Uint(!a),
                _ => unreachable!("pop_integer filtered"),
            },
            Opcode::Shl => {
                let n = self.pop_shift(exec, op)?;
                match self.pop_integer(exec, op)? {
                    Value::Int(_) if n >= 64 => Value::Int(0),
                    Value::Int(a) => Value::Int(((a as u64) << n) as i64),
                    Value::Uint(_) if n >= 64 => Value::Uint(0),
                    Value::Uint(a) => Value::Uint(a << n),
                    _ => unreachable!("pop_integer filtered"),
                }
            }
            Opcode::Shr => {
                let n = self.pop_shift(exec, op)?;
                match self.pop_integer(exec, op)? {
                    // Arithmetic right shift sign-fills past 64 bits.
                    Value::Int(a) if n >= 64 => Value::Int(a >> 63),
                    Value::Int(a) => Value::Int(a >> n),
                    Value::Uint(_) if n >= 64 => Value::Uint(0),
                    Value::Uint(a) => Value::Uint(a >> n),
                    _ => unreachable!("pop_integer filtered"),
                }
            }
            Opcode::ShrU => {
                let n = self.pop_shift(exec, op)?;
                match self.pop_integer(exec, op)? {
                    Value::Int(_) if n >= 64 => Value::Int(0),
                    Value::Int(a) => Value::Int(((a as u64) >> n) as i64),
                    Value::Uint(_) if n >= 64 => Value::Uint(0),
                    Value::Uint(a) => Value::Uint(a >> n),
                    _ => unreachable!("pop_integer filtered"),
                }
            }
            other => {
                return Err(VmError::InvalidInstruction(format!(
                    "{:?} is not a bitwise opcode",
                    other
                )))
            }
        };
        self.push(exec, result)
    }

    fn pop_integer(&self, exec: &mut ExecState, op: Opcode) -> VmResult<Value> {
        let value = self.pop(exec, op)?;
        match value {
            Value::Int(_) | Value::Uint(_) => Ok(value),
            other => Err(VmError::TypeMismatch {
                expected: "integer".into(),
                found: other.type_name().into(),
            }),
        }
    }

    fn pop_shift(&self, exec: &mut ExecState, op: Opcode) -> VmResult<u64> {
        match self.pop_integer(exec, op)? {
            Value::Int(n) if n >= 0 => Ok(n as u64),
            Value::Int(_) => Err(VmError::Value("shift amount must be non-negative".into())),
            Value::Uint(n) => Ok(n),
            _ => unreachable!("pop_integer filtered"),
        }
    }

    fn bit_binary(
        &self,
        exec: &mut ExecState,
        op: Opcode,
        f: fn(u64, u64) -> u64,
    ) -> VmResult<Value> {
        let b = self.pop_integer(exec, op)?;
        let a = self.pop_integer(exec, op)?;
        Ok(match (&a, &b) {
            (Value::Uint(x), Value::Uint(y)) => Value::Uint(f(*x, *y)),
            _ => {
                let x = match a {
                    Value::Int(i) => i as u64,
                    Value::Uint(u) => u,
                    _ => unreachable!("pop_integer filtered"),
                };
                let y = match b {
                    Value::Int(i) => i as u64,
                    Value::Uint(u) => u,
                    _ => unreachable!("pop_integer filtered"),
                };
                Value::Int(f(x, y) as i64)
            }
        })
    }
}
