//! Reeve VM Core Runtime
//!
//! This crate provides the virtual machine runtime:
//! - Stack-based bytecode interpreter (one dispatch routine per opcode family)
//! - Lightweight isolated processes with per-process mailboxes
//! - Reduction-counting cooperative scheduler with priority run queues
//! - Link/monitor registry and asynchronous exit-signal fan-out
//! - Supervision trees with restart strategies and restart windows
//!
//! The engine drives all process execution from a single dispatch loop;
//! the fault handler is the only other thread, fed through a bounded
//! channel. Shared containers (mailboxes, registries, queues) carry their
//! own locks so both sides can touch them safely.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod debug;
pub mod dump;
pub mod engine;
pub mod fault;
pub mod interpreter;
pub mod links;
pub mod mailbox;
pub mod message;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod shared;
pub mod supervisor;

pub use config::{MailboxPolicy, VmConfig};
pub use debug::{DebugAction, DebugHook};
pub use dump::{CrashDump, CrashStore};
pub use engine::{Engine, StatsSnapshot};
pub use fault::FaultHandler;
pub use interpreter::Executor;
pub use links::LinkRegistry;
pub use mailbox::Mailbox;
pub use message::{AckStatus, Acknowledgment, ExitReason, Message};
pub use process::{Addr, Priority, Process, ProcessState};
pub use registry::ProcessRegistry;
pub use scheduler::{Scheduler, TimerManager};
pub use supervisor::{
    ChildKind, ChildSpec, RestartPolicy, ShutdownPolicy, Strategy, SupervisorRegistry,
};

/// VM execution errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    /// Generic runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Malformed or unexpected instruction
    #[error("Invalid instruction: {0}")]
    InvalidInstruction(String),

    /// A value could not be resolved to a live process address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Jump target outside the owning code block
    #[error("Invalid jump target {target} (code length {len})")]
    InvalidJumpTarget {
        /// Requested target address
        target: i64,
        /// Length of the code block
        len: usize,
    },

    /// Operand type did not match what the opcode requires
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// What the opcode needed
        expected: String,
        /// What was on the stack
        found: String,
    },

    /// Load of an unset local, global, or upvalue
    #[error("Undefined variable: {0}")]
    UndefinedVariable(String),

    /// CALL target not present in the subroutine table
    #[error("Undefined subroutine: {0}")]
    UndefinedSubroutine(String),

    /// Built-in function key absent from the registry
    #[error("Undefined function: {0}")]
    UndefinedFunction(String),

    /// Domain error on an otherwise well-typed value
    #[error("Value error: {0}")]
    Value(String),

    /// Not enough values on the data stack
    #[error("Stack underflow in {0}")]
    StackUnderflow(String),

    /// Data stack exceeded the configured maximum
    #[error("Stack overflow (limit {limit})")]
    StackOverflow {
        /// Configured maximum depth
        limit: usize,
    },

    /// Division or modulo by zero
    #[error("Division by zero")]
    DivisionByZero,

    /// Index outside a collection
    #[error("Index {index} out of bounds (length {len})")]
    IndexOutOfBounds {
        /// Requested index
        index: i64,
        /// Collection length
        len: usize,
    },

    /// Failed value conversion
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Malformed binary or string data
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Send to a full mailbox under the fail policy
    #[error("Mailbox overflow for process {target}")]
    MailboxOverflow {
        /// The receiving process address
        target: u64,
    },

    /// Wait-for cycle among parked processes
    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    /// Host-level failure routed through the exception machinery
    #[error("Unhandled error: {0}")]
    Unhandled(String),
}

impl VmError {
    /// Stable lower-case name for this error kind, used as the `error`
    /// field of structured exception values.
    pub fn kind_name(&self) -> &'static str {
        match self {
            VmError::Runtime(_) => "runtime",
            VmError::InvalidInstruction(_) => "invalid_instruction",
            VmError::InvalidAddress(_) => "invalid_address",
            VmError::InvalidJumpTarget { .. } => "invalid_jump_target",
            VmError::TypeMismatch { .. } => "type_mismatch",
            VmError::UndefinedVariable(_) => "undefined_variable",
            VmError::UndefinedSubroutine(_) => "undefined_subroutine",
            VmError::UndefinedFunction(_) => "undefined_function",
            VmError::Value(_) => "value",
            VmError::StackUnderflow(_) => "stack_underflow",
            VmError::StackOverflow { .. } => "stack_overflow",
            VmError::DivisionByZero => "division_by_zero",
            VmError::IndexOutOfBounds { .. } => "index_out_of_bounds",
            VmError::Conversion(_) => "conversion",
            VmError::Encoding(_) => "encoding",
            VmError::MailboxOverflow { .. } => "mailbox_overflow",
            VmError::Deadlock(_) => "deadlock",
            VmError::Unhandled(_) => "unhandled",
        }
    }
}

/// VM execution result
pub type VmResult<T> = Result<T, VmError>;
