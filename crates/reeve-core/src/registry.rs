//! Process name registry
//!
//! Names are unique; registering a taken name fails rather than
//! replacing the holder.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::process::Addr;

/// Name → address table.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    names: RwLock<FxHashMap<String, Addr>>,
}

impl ProcessRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `addr` under `name`. Returns false if the name is taken.
    pub fn register(&self, name: impl Into<String>, addr: Addr) -> bool {
        let name = name.into();
        let mut names = self.names.write();
        if names.contains_key(&name) {
            return false;
        }
        names.insert(name, addr);
        true
    }

    /// Drop a registration. Returns false if the name was not registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.names.write().remove(name).is_some()
    }

    /// Look up the address registered under `name`.
    pub fn whereis(&self, name: &str) -> Option<Addr> {
        self.names.read().get(name).copied()
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    /// Whether no names are registered.
    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }
}
