//! Program container
//!
//! A `Program` is what embedders hand to the engine when spawning a
//! process: a main instruction list, named subroutines appended after it,
//! and initial globals. Subroutine code lives inside the process's own
//! instruction list; the table records where each one starts so CALL can
//! jump to it by name.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::instruction::Instruction;
use crate::value::Value;

/// A named subroutine: its code block and the address it starts at
/// within the owning program's instruction list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subroutine {
    /// Subroutine name, resolved by CALL / CALL_DYNAMIC.
    pub name: String,
    /// The subroutine body (also present in the program's instructions).
    pub code: Vec<Instruction>,
    /// Absolute start address within the program's instructions.
    pub start: usize,
}

/// A complete unit of executable code for one process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Main instruction list, subroutine bodies included.
    pub instructions: Vec<Instruction>,
    /// Named subroutines with their start addresses.
    pub subroutines: Vec<Subroutine>,
    /// Initial globals for the spawned process.
    pub globals: IndexMap<String, Value>,
}

impl Program {
    /// A program running just the given main code.
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self {
            instructions,
            ..Default::default()
        }
    }

    /// Append a subroutine body after the current instructions and record
    /// its start address. Main code is expected to HALT or RETURN before
    /// falling through into subroutine bodies.
    pub fn add_subroutine(&mut self, name: impl Into<String>, code: Vec<Instruction>) -> usize {
        let start = self.instructions.len();
        self.instructions.extend(code.iter().cloned());
        self.subroutines.push(Subroutine {
            name: name.into(),
            code,
            start,
        });
        start
    }

    /// Set an initial global.
    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    #[test]
    fn test_subroutine_start_addresses() {
        let mut program = Program::new(vec![
            Instruction::with(Opcode::Call, Value::str("double")),
            Instruction::op(Opcode::Halt),
        ]);
        let start = program.add_subroutine(
            "double",
            vec![
                Instruction::with(Opcode::PushInt, Value::Int(2)),
                Instruction::op(Opcode::Mul),
                Instruction::op(Opcode::ReturnValue),
            ],
        );
        assert_eq!(start, 2);
        assert_eq!(program.instructions.len(), 5);
        assert_eq!(program.subroutines[0].start, 2);
    }
}
