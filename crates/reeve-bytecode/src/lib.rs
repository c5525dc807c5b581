//! Reeve VM Bytecode Definitions
//!
//! This crate provides the core instruction set and the runtime value model
//! for the Reeve virtual machine: the opcode enumeration, the instruction
//! container (opcode + operand value), and the tagged `Value` sum type that
//! flows through process stacks and mailboxes.
//!
//! Code in Reeve is a plain `Vec<Instruction>` addressed by zero-based index;
//! there is no on-disk encoding here. Every process owns its own copy of its
//! code, so this crate is deliberately free of any runtime state.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod instruction;
pub mod opcode;
pub mod program;
pub mod value;

pub use instruction::Instruction;
pub use opcode::Opcode;
pub use program::{Program, Subroutine};
pub use value::{Lambda, MonitorRef, Value};
