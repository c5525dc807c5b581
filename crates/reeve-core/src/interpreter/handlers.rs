//! Custom opcode handlers
//!
//! Embedders may intercept any opcode; a registered handler replaces the
//! built-in dispatch for that opcode, including the counter policy.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use reeve_bytecode::{Instruction, Opcode};

use crate::process::{ExecState, Process};
use crate::VmResult;

/// A custom opcode implementation.
pub type OpcodeHandler =
    Arc<dyn Fn(&Arc<Process>, &mut ExecState, &Instruction) -> VmResult<()> + Send + Sync>;

/// Opcode → override table.
#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<FxHashMap<Opcode, OpcodeHandler>>,
}

impl HandlerTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an override for one opcode.
    pub fn register<F>(&self, opcode: Opcode, handler: F)
    where
        F: Fn(&Arc<Process>, &mut ExecState, &Instruction) -> VmResult<()>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.write().insert(opcode, Arc::new(handler));
    }

    /// Remove an override.
    pub fn unregister(&self, opcode: Opcode) -> bool {
        self.handlers.write().remove(&opcode).is_some()
    }

    /// Look up the override for an opcode.
    pub fn get(&self, opcode: Opcode) -> Option<OpcodeHandler> {
        self.handlers.read().get(&opcode).cloned()
    }
}
