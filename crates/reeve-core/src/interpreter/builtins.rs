//! Built-in function registry
//!
//! CALL_BUILT_IN dispatches `(module, function, arity)` against this
//! table. The default set covers the pure value predicates and helpers
//! under the `core` module; embedders register the rest.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use reeve_bytecode::Value;

use crate::{VmError, VmResult};

/// A built-in function body: a pure value transformer.
pub type BuiltinFn = Arc<dyn Fn(&[Value]) -> VmResult<Value> + Send + Sync>;

/// `(module, function, arity)` → implementation.
#[derive(Default)]
pub struct BuiltinRegistry {
    functions: RwLock<FxHashMap<(String, String, usize), BuiltinFn>>,
}

impl BuiltinRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry seeded with the `core` module defaults.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.install_core();
        registry
    }

    /// Register a function; replaces any previous entry for the key.
    pub fn register<F>(&self, module: &str, function: &str, arity: usize, body: F)
    where
        F: Fn(&[Value]) -> VmResult<Value> + Send + Sync + 'static,
    {
        self.functions.write().insert(
            (module.to_string(), function.to_string(), arity),
            Arc::new(body),
        );
    }

    /// Whether a key is registered.
    pub fn contains(&self, module: &str, function: &str, arity: usize) -> bool {
        self.functions
            .read()
            .contains_key(&(module.to_string(), function.to_string(), arity))
    }

    /// Invoke a registered function.
    pub fn call(&self, module: &str, function: &str, args: &[Value]) -> VmResult<Value> {
        let key = (module.to_string(), function.to_string(), args.len());
        let body = self
            .functions
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| {
                VmError::UndefinedFunction(format!("{}:{}/{}", module, function, args.len()))
            })?;
        body(args)
    }

    fn install_core(&self) {
        fn predicate(
            registry: &BuiltinRegistry,
            name: &str,
            test: fn(&Value) -> bool,
        ) {
            registry.register("core", name, 1, move |args| {
                Ok(Value::Bool(test(&args[0])))
            });
        }

        predicate(self, "is_integer", |v| {
            matches!(v, Value::Int(_) | Value::Uint(_))
        });
        predicate(self, "is_float", |v| matches!(v, Value::Float(_)));
        predicate(self, "is_number", Value::is_numeric);
        predicate(self, "is_boolean", |v| matches!(v, Value::Bool(_)));
        predicate(self, "is_string", |v| matches!(v, Value::Str(_)));
        predicate(self, "is_symbol", |v| matches!(v, Value::Symbol(_)));
        predicate(self, "is_array", |v| matches!(v, Value::Array(_)));
        predicate(self, "is_map", |v| matches!(v, Value::Map(_)));
        predicate(self, "is_binary", |v| matches!(v, Value::Binary(_)));
        predicate(self, "is_lambda", |v| matches!(v, Value::Lambda(_)));
        predicate(self, "is_null", |v| matches!(v, Value::Null));

        self.register("core", "type_of", 1, |args| {
            Ok(Value::symbol(args[0].type_name()))
        });
        self.register("core", "to_string", 1, |args| {
            Ok(Value::Str(args[0].to_string()))
        });
        self.register("core", "length", 1, |args| match &args[0] {
            Value::Str(s) => Ok(Value::Uint(s.chars().count() as u64)),
            Value::Array(a) => Ok(Value::Uint(a.len() as u64)),
            Value::Map(m) => Ok(Value::Uint(m.len() as u64)),
            Value::Binary(b) => Ok(Value::Uint(b.len() as u64)),
            other => Err(VmError::TypeMismatch {
                expected: "string, array, map, or binary".into(),
                found: other.type_name().into(),
            }),
        });
        self.register("core", "array_get", 2, |args| match (&args[0], &args[1]) {
            (Value::Array(items), index) => {
                let i = index.as_address().ok_or_else(|| VmError::TypeMismatch {
                    expected: "index".into(),
                    found: index.type_name().into(),
                })? as usize;
                items
                    .get(i)
                    .cloned()
                    .ok_or(VmError::IndexOutOfBounds {
                        index: i as i64,
                        len: items.len(),
                    })
            }
            (other, _) => Err(VmError::TypeMismatch {
                expected: "array".into(),
                found: other.type_name().into(),
            }),
        });
        self.register("core", "map_get", 2, |args| match (&args[0], &args[1]) {
            (Value::Map(map), key) => {
                let key = key.as_name().ok_or_else(|| VmError::TypeMismatch {
                    expected: "key".into(),
                    found: key.type_name().into(),
                })?;
                Ok(map.get(key).cloned().unwrap_or(Value::Null))
            }
            (other, _) => Err(VmError::TypeMismatch {
                expected: "map".into(),
                found: other.type_name().into(),
            }),
        });
    }
}
