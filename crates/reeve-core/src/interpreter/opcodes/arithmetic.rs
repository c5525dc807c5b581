//! Arithmetic opcode handlers
//!
//! Numeric widening: if either operand is a float the result is a float;
//! otherwise two unsigned operands stay unsigned, and anything else is
//! signed. Integer arithmetic wraps; division and modulo raise on a zero
//! denominator.

use reeve_bytecode::{Instruction, Opcode, Value};

use crate::interpreter::Executor;
use crate::process::ExecState;
use crate::{VmError, VmResult};

impl Executor {
    pub(in crate::interpreter) fn exec_arithmetic_ops(
        &self,
        exec: &mut ExecState,
        instr: &Instruction,
    ) -> VmResult<()> {
        let op = instr.opcode;
        let result = match op {
            Opcode::Add => self.binary(exec, op, |a, b| a.wrapping_add(b), |a, b| a.wrapping_add(b), |a, b| Ok(a + b))?,
            Opcode::Sub => self.binary(exec, op, |a, b| a.wrapping_sub(b), |a, b| a.wrapping_sub(b), |a, b| Ok(a - b))?,
            Opcode::Mul => self.binary(exec, op, |a, b| a.wrapping_mul(b), |a, b| a.wrapping_mul(b), |a, b| Ok(a * b))?,
            Opcode::Div => {
                let (a, b) = self.pop_numeric_pair(exec, op)?;
                div_like(a, b, |a, b| a.wrapping_div(b), |a, b| a / b, |a, b| a / b)?
            }
            Opcode::Mod => {
                let (a, b) = self.pop_numeric_pair(exec, op)?;
                div_like(a, b, |a, b| a.wrapping_rem(b), |a, b| a % b, |a, b| a % b)?
            }
            Opcode::Neg => match self.pop_numeric(exec, op)? {
                Value::Int(i) => Value::Int(i.wrapping_neg()),
                Value::Uint(u) => Value::Int((u as i64).wrapping_neg()),
                Value::Float(f) => Value::Float(-f),
                _ => unreachable!("pop_numeric filtered"),
            },
            Opcode::Abs => match self.pop_numeric(exec, op)? {
                Value::Int(i) => Value::Int(i.wrapping_abs()),
                Value::Uint(u) => Value::Uint(u),
                Value::Float(f) => Value::Float(f.abs()),
                _ => unreachable!("pop_numeric filtered"),
            },
            Opcode::Inc => match self.pop_numeric(exec, op)? {
                Value::Int(i) => Value::Int(i.wrapping_add(1)),
                Value::Uint(u) => Value::Uint(u.wrapping_add(1)),
                Value::Float(f) => Value::Float(f + 1.0),
                _ => unreachable!("pop_numeric filtered"),
            },
            Opcode::Dec => match self.pop_numeric(exec, op)? {
                Value::Int(i) => Value::Int(i.wrapping_sub(1)),
                Value::Uint(u) => Value::Uint(u.wrapping_sub(1)),
                Value::Float(f) => Value::Float(f - 1.0),
                _ => unreachable!("pop_numeric filtered"),
            },
            Opcode::Pow => {
                let (a, b) = self.pop_numeric_pair(exec, op)?;
                match (&a, &b) {
                    (Value::Float(_), _) | (_, Value::Float(_)) => {
                        let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                        Value::Float(x.powf(y))
                    }
                    (Value::Uint(x), Value::Uint(y)) => {
                        Value::Uint(x.wrapping_pow(clamp_exponent(*y as i64)))
                    }
                    _ => {
                        let x = int_of(&a);
                        let y = int_of(&b);
                        if y < 0 {
                            Value::Float((x as f64).powi(y as i32))
                        } else {
                            Value::Int(x.wrapping_pow(clamp_exponent(y)))
                        }
                    }
                }
            }
            Opcode::Floor => self.round_like(exec, op, f64::floor)?,
            Opcode::Ceil => self.round_like(exec, op, f64::ceil)?,
            Opcode::Round => self.round_like(exec, op, f64::round)?,
            Opcode::Min | Opcode::Max => {
                let (a, b) = self.pop_numeric_pair(exec, op)?;
                let ordering = a.compare(&b).ok_or(VmError::TypeMismatch {
                    expected: "comparable numbers".into(),
                    found: "nan".into(),
                })?;
                let take_first = if op == Opcode::Min {
                    ordering != std::cmp::Ordering::Greater
                } else {
                    ordering != std::cmp::Ordering::Less
                };
                if take_first {
                    a
                } else {
                    b
                }
            }
            other => {
                return Err(VmError::InvalidInstruction(format!(
                    "{:?} is not an arithmetic opcode",
                    other
                )))
            }
        };
        self.push(exec, result)
    }

    fn pop_numeric(&self, exec: &mut ExecState, op: Opcode) -> VmResult<Value> {
        let value = self.pop(exec, op)?;
        if !value.is_numeric() {
            return Err(VmError::TypeMismatch {
                expected: "number".into(),
                found: value.type_name().into(),
            });
        }
        Ok(value)
    }

    fn pop_numeric_pair(&self, exec: &mut ExecState, op: Opcode) -> VmResult<(Value, Value)> {
        let b = self.pop_numeric(exec, op)?;
        let a = self.pop_numeric(exec, op)?;
        Ok((a, b))
    }

    fn binary(
        &self,
        exec: &mut ExecState,
        op: Opcode,
        f_int: fn(i64, i64) -> i64,
        f_uint: fn(u64, u64) -> u64,
        f_float: fn(f64, f64) -> VmResult<f64>,
    ) -> VmResult<Value> {
        let (a, b) = self.pop_numeric_pair(exec, op)?;
        Ok(match (&a, &b) {
            (Value::Float(_), _) | (_, Value::Float(_)) => {
                Value::Float(f_float(a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0))?)
            }
            (Value::Uint(x), Value::Uint(y)) => Value::Uint(f_uint(*x, *y)),
            _ => Value::Int(f_int(int_of(&a), int_of(&b))),
        })
    }

    fn round_like(
        &self,
        exec: &mut ExecState,
        op: Opcode,
        f: fn(f64) -> f64,
    ) -> VmResult<Value> {
        Ok(match self.pop_numeric(exec, op)? {
            Value::Float(x) => Value::Float(f(x)),
            whole => whole,
        })
    }
}

fn int_of(value: &Value) -> i64 {
    match value {
        Value::Int(i) => *i,
        Value::Uint(u) => *u as i64,
        _ => 0,
    }
}

fn clamp_exponent(y: i64) -> u32 {
    y.clamp(0, u32::MAX as i64) as u32
}

fn div_like(
    a: Value,
    b: Value,
    f_int: fn(i64, i64) -> i64,
    f_uint: fn(u64, u64) -> u64,
    f_float: fn(f64, f64) -> f64,
) -> VmResult<Value> {
    match (&a, &b) {
        (Value::Float(_), _) | (_, Value::Float(_)) => {
            let denominator = b.as_f64().unwrap_or(0.0);
            if denominator == 0.0 {
                return Err(VmError::DivisionByZero);
            }
            Ok(Value::Float(f_float(a.as_f64().unwrap_or(0.0), denominator)))
        }
        (Value::Uint(x), Value::Uint(y)) => {
            if *y == 0 {
                return Err(VmError::DivisionByZero);
            }
            Ok(Value::Uint(f_uint(*x, *y)))
        }
        _ => {
            let (x, y) = (int_of(&a), int_of(&b));
            if y == 0 {
                return Err(VmError::DivisionByZero);
            }
            Ok(Value::Int(f_int(x, y)))
        }
    }
}
