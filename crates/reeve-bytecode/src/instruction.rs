//! Instruction container
//!
//! An instruction is an opcode plus a single operand value. Operands that
//! are not needed default to null; composite operands (call targets,
//! lambda bodies) travel as arrays or nested instruction blocks.

use serde::{Deserialize, Serialize};

use crate::opcode::Opcode;
use crate::value::Value;

/// One decoded instruction: opcode + operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// The operation to perform.
    pub opcode: Opcode,
    /// The operand value, `Value::Null` when unused.
    #[serde(default, skip_serializing_if = "operand_is_null")]
    pub operand: Value,
}

fn operand_is_null(v: &Value) -> bool {
    matches!(v, Value::Null)
}

impl Instruction {
    /// An instruction without an operand.
    pub fn op(opcode: Opcode) -> Self {
        Self {
            opcode,
            operand: Value::Null,
        }
    }

    /// An instruction with an operand.
    pub fn with(opcode: Opcode, operand: Value) -> Self {
        Self { opcode, operand }
    }
}
