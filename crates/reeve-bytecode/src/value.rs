//! Runtime value model
//!
//! `Value` is the tagged sum type that flows through process data stacks,
//! locals, globals, and mailboxes. Primitives and collections compare
//! structurally (numerics cross-type: an `Int`, `Uint`, and `Float` holding
//! the same number are equal); lambdas and monitor references compare by
//! identity, carried in an id minted at creation time so that identity
//! survives deep cloning.

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::instruction::Instruction;

static NEXT_LAMBDA_ID: AtomicU64 = AtomicU64::new(1);

/// A closure: a code block plus parameter names, a by-name captured
/// environment (spliced into globals on invocation), an index-addressed
/// upvalue list, and any arguments bound by partial application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lambda {
    /// Identity of this lambda; preserved across clones.
    pub id: u64,
    /// The lambda body.
    pub code: Arc<Vec<Instruction>>,
    /// Parameter names, bound to fresh locals on invocation.
    pub params: Vec<String>,
    /// Captured globals by name, injected on invocation.
    pub captured: IndexMap<String, Value>,
    /// Captured values addressable by index from the body.
    pub upvalues: Vec<Value>,
    /// Arguments prepended by LAMBDA_BIND.
    pub bound: Vec<Value>,
}

impl Lambda {
    /// Create a lambda with a fresh identity and no captures.
    pub fn new(code: Vec<Instruction>, params: Vec<String>) -> Self {
        Self {
            id: NEXT_LAMBDA_ID.fetch_add(1, AtomicOrdering::Relaxed),
            code: Arc::new(code),
            params,
            captured: IndexMap::new(),
            upvalues: Vec::new(),
            bound: Vec::new(),
        }
    }

    /// Replace the captured environment; the upvalue list mirrors the
    /// capture order so LOAD_UPVALUE(i) sees the i-th captured value.
    pub fn with_captures(mut self, captured: IndexMap<String, Value>) -> Self {
        self.upvalues = captured.values().cloned().collect();
        self.captured = captured;
        self
    }

    /// Derive a partial application with extra bound arguments. The result
    /// is a new lambda identity.
    pub fn bind(&self, args: Vec<Value>) -> Self {
        let mut bound = self.bound.clone();
        bound.extend(args);
        Self {
            id: NEXT_LAMBDA_ID.fetch_add(1, AtomicOrdering::Relaxed),
            code: Arc::clone(&self.code),
            params: self.params.clone(),
            captured: self.captured.clone(),
            upvalues: self.upvalues.clone(),
            bound,
        }
    }
}

impl PartialEq for Lambda {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// A monitor reference: identifies one (watcher, watched) monitor.
/// Equality is identity on the reference id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MonitorRef {
    /// Reference identity.
    pub id: u64,
    /// The watching process address.
    pub watcher: u64,
    /// The watched process address.
    pub watched: u64,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl PartialEq for MonitorRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MonitorRef {}

/// Tagged runtime value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// The absent value
    Null,
    /// Boolean
    Bool(bool),
    /// Signed 64-bit integer
    Int(i64),
    /// Unsigned 64-bit integer
    Uint(u64),
    /// 64-bit float
    Float(f64),
    /// UTF-8 string
    Str(String),
    /// Symbol, compared by name
    Symbol(String),
    /// Ordered sequence
    Array(Vec<Value>),
    /// String-keyed map preserving insertion order
    Map(IndexMap<String, Value>),
    /// Raw byte sequence
    Binary(Vec<u8>),
    /// Closure (identity equality)
    Lambda(Box<Lambda>),
    /// Raw code block, for closure bodies and indirect calls
    Instructions(Arc<Vec<Instruction>>),
    /// Monitor reference (identity equality)
    MonitorRef(MonitorRef),
}

impl Value {
    /// Build a map value from key/value pairs, preserving order.
    pub fn map<I, K>(pairs: I) -> Value
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Map(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build a string value.
    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    /// Build a symbol value.
    pub fn symbol(s: impl Into<String>) -> Value {
        Value::Symbol(s.into())
    }

    /// Human-facing name of this value's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Uint(_) => "unsigned_integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Binary(_) => "binary",
            Value::Lambda(_) => "lambda",
            Value::Instructions(_) => "instructions",
            Value::MonitorRef(_) => "monitor_ref",
        }
    }

    /// Truthiness: null and false are falsy, empty strings, arrays, maps,
    /// and binaries are falsy, everything else (including zero) is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
            Value::Symbol(_) => true,
            Value::Array(a) => !a.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Binary(b) => !b.is_empty(),
            _ => true,
        }
    }

    /// Whether this is a numeric value.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Uint(_) | Value::Float(_))
    }

    /// Numeric view as f64, if numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Uint(u) => Some(*u as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Interpret as a process address: a non-negative Int or a Uint.
    pub fn as_address(&self) -> Option<u64> {
        match self {
            Value::Int(i) if *i >= 0 => Some(*i as u64),
            Value::Uint(u) => Some(*u),
            _ => None,
        }
    }

    /// Borrow the string content of a Str or Symbol.
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// Structural ordering per the comparison opcodes. `None` means the
    /// two values are not comparable (unlike non-numeric types, or a NaN
    /// on either side).
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (a, b) if a.is_numeric() && b.is_numeric() => numeric_cmp(a, b),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Symbol(a), Value::Symbol(b)) => Some(a.cmp(b)),
            (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        non_eq => return Some(non_eq),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        }
    }

    /// Identity equality: pointer-free object identity for lambdas and
    /// monitor refs, structural for everything else.
    pub fn is_identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Lambda(a), Value::Lambda(b)) => a.id == b.id,
            (Value::MonitorRef(a), Value::MonitorRef(b)) => a.id == b.id,
            (Value::Instructions(a), Value::Instructions(b)) => Arc::ptr_eq(a, b),
            _ => self == other,
        }
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Float(_), _) | (_, Value::Float(_)) => {
            let (x, y) = (a.as_f64()?, b.as_f64()?);
            x.partial_cmp(&y)
        }
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Uint(x), Value::Uint(y)) => Some(x.cmp(y)),
        // Mixed signedness compares exactly through i128.
        (Value::Int(x), Value::Uint(y)) => Some((*x as i128).cmp(&(*y as i128))),
        (Value::Uint(x), Value::Int(y)) => Some((*x as i128).cmp(&(*y as i128))),
        _ => None,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (a, b) if a.is_numeric() && b.is_numeric() => {
                numeric_cmp(a, b) == Some(Ordering::Equal)
            }
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v))
            }
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::Lambda(a), Value::Lambda(b)) => a.id == b.id,
            (Value::Instructions(a), Value::Instructions(b)) => a == b,
            (Value::MonitorRef(a), Value::MonitorRef(b)) => a.id == b.id,
            _ => false,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Uint(u) => write!(f, "{}", u),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::Symbol(s) => write!(f, ":{}", s),
            Value::Array(a) => {
                write!(f, "[")?;
                for (i, v) in a.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Binary(b) => write!(f, "<<{} bytes>>", b.len()),
            Value::Lambda(l) => write!(f, "#lambda<{}>", l.id),
            Value::Instructions(code) => write!(f, "#code<{} instrs>", code.len()),
            Value::MonitorRef(r) => write!(f, "#ref<{}>", r.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    #[test]
    fn test_cross_numeric_equality() {
        assert_eq!(Value::Int(7), Value::Uint(7));
        assert_eq!(Value::Int(7), Value::Float(7.0));
        assert_eq!(Value::Uint(0), Value::Float(0.0));
        assert_ne!(Value::Int(-1), Value::Uint(u64::MAX));
        assert_ne!(Value::Float(f64::NAN), Value::Float(f64::NAN));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::str("").is_truthy());
        assert!(!Value::Array(vec![]).is_truthy());
        assert!(!Value::Binary(vec![]).is_truthy());
        // Zero is truthy; only emptiness and null/false are falsy.
        assert!(Value::Int(0).is_truthy());
        assert!(Value::Float(0.0).is_truthy());
        assert!(Value::symbol("ok").is_truthy());
    }

    #[test]
    fn test_ordering() {
        assert_eq!(
            Value::Int(1).compare(&Value::Float(2.0)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::str("abc").compare(&Value::str("abd")),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Array(vec![Value::Int(1), Value::Int(2)])
                .compare(&Value::Array(vec![Value::Int(1)])),
            Some(Ordering::Greater)
        );
        // Unlike non-numeric types and NaN are incomparable.
        assert_eq!(Value::str("a").compare(&Value::Int(1)), None);
        assert_eq!(Value::Float(f64::NAN).compare(&Value::Float(1.0)), None);
    }

    #[test]
    fn test_lambda_identity() {
        let l1 = Lambda::new(vec![], vec![]);
        let l2 = Lambda::new(vec![], vec![]);
        assert_ne!(l1.id, l2.id);

        let v1 = Value::Lambda(Box::new(l1));
        let v2 = v1.clone();
        // Identity survives deep cloning.
        assert_eq!(v1, v2);
        assert!(v1.is_identical(&v2));
    }

    #[test]
    fn test_clone_does_not_alias() {
        let original = Value::Array(vec![Value::Int(1)]);
        let mut cloned = original.clone();
        if let Value::Array(items) = &mut cloned {
            items.push(Value::Int(2));
        }
        assert_eq!(original, Value::Array(vec![Value::Int(1)]));
    }

    #[test]
    fn test_map_equality_ignores_order() {
        let a = Value::map([("x", Value::Int(1)), ("y", Value::Int(2))]);
        let b = Value::map([("y", Value::Int(2)), ("x", Value::Int(1))]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_lambda_bind_accumulates() {
        let base = Lambda::new(
            vec![Instruction::op(Opcode::Return)],
            vec!["a".into(), "b".into()],
        );
        let once = base.bind(vec![Value::Int(1)]);
        let twice = once.bind(vec![Value::Int(2)]);
        assert_eq!(twice.bound, vec![Value::Int(1), Value::Int(2)]);
        assert_ne!(base.id, twice.id);
    }

    #[test]
    fn test_address_view() {
        assert_eq!(Value::Int(4).as_address(), Some(4));
        assert_eq!(Value::Uint(9).as_address(), Some(9));
        assert_eq!(Value::Int(-1).as_address(), None);
        assert_eq!(Value::str("main").as_address(), None);
    }
}
