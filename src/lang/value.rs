use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::chunk::BytecodeFunction;
use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::vm::Vm;

/// Shared, mutable array storage. Identity-equal only to itself.
pub type ArrayRef = Rc<RefCell<Vec<Value>>>;

/// Shared, mutable, insertion-ordered string-keyed map storage.
pub type MapRef = Rc<RefCell<IndexMap<String, Value>>>;

/// Implementation of a host-provided function.
///
/// Natives receive the VM so that higher-order natives can re-enter it
/// through [`Vm::invoke`] to call a script closure.
pub type NativeImpl = fn(&mut Vm, &[Value]) -> Result<Value, RuntimeError>;

/// A host function exposed by name in the global environment.
pub struct NativeFn {
    pub name: String,
    /// Expected argument count; `-1` means variadic (no arity check).
    pub arity: i16,
    pub func: NativeImpl,
}

/// A runtime closure: a compiled function plus its captured upvalues.
pub struct Closure {
    pub function: Rc<BytecodeFunction>,
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

/// A captured variable from an enclosing scope.
///
/// While the captured local is still live on the value stack the upvalue is
/// open and holds the absolute stack index. When that slot is about to leave
/// the stack the upvalue closes, copying the value into its own cell. The
/// transition happens exactly once; closed upvalues never reopen.
#[derive(Debug, Clone)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

impl Upvalue {
    pub fn is_open(&self) -> bool {
        matches!(self, Upvalue::Open(_))
    }
}

/// Runtime value in the Tmbdl language.
///
/// Every layer of the pipeline (generator constants, VM stack, globals,
/// native arguments) traffics in this one tagged sum.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    /// All numerics are 64-bit floats.
    Number(f64),
    Str(Rc<str>),
    Array(ArrayRef),
    Map(MapRef),
    Native(Rc<NativeFn>),
    /// Constant-pool form of a compiled function, before capture.
    Function(Rc<BytecodeFunction>),
    Closure(Rc<Closure>),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(Rc::from(s.into().into_boxed_str()))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn map(entries: IndexMap<String, Value>) -> Value {
        Value::Map(Rc::new(RefCell::new(entries)))
    }

    /// Truthiness used by conditional jumps and logical operators.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Native(_) => "native fn",
            Value::Function(_) => "fn",
            Value::Closure(_) => "fn",
        }
    }
}

/// Structural equality for primitives, reference identity for everything
/// else. Cross-variant comparisons are always unequal; there is no coercion.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    /// The canonical stringification, shared by `PRINT`, `EYEOF` and string
    /// concatenation. Booleans render with their source keywords.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(true) => write!(f, "goldberry"),
            Value::Bool(false) => write!(f, "sauron"),
            Value::Number(n) => {
                if *n == (*n as i64) as f64 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Str(s) => write!(f, "{}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
            Value::Native(n) => write!(f, "<native fn {}>", n.name),
            Value::Function(func) => write!(f, "<fn {}>", func.name),
            Value::Closure(c) => write!(f, "<fn {}>", c.function.name),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(Value::Number(-1.5).is_truthy());
        assert!(!Value::str("").is_truthy());
        assert!(Value::str("x").is_truthy());
        assert!(Value::array(vec![]).is_truthy());
        assert!(Value::map(IndexMap::new()).is_truthy());
    }

    #[test]
    fn test_primitive_equality_is_structural() {
        assert_eq!(Value::Number(2.0), Value::Number(2.0));
        assert_eq!(Value::str("abc"), Value::str("abc"));
        assert_ne!(Value::str("abc"), Value::str("abd"));
        assert_eq!(Value::Null, Value::Null);
    }

    #[test]
    fn test_no_cross_variant_coercion() {
        assert_ne!(Value::Number(1.0), Value::str("1"));
        assert_ne!(Value::Bool(false), Value::Number(0.0));
        assert_ne!(Value::Null, Value::Bool(false));
    }

    #[test]
    fn test_reference_equality_is_identity() {
        let a = Value::array(vec![Value::Number(1.0)]);
        let b = Value::array(vec![Value::Number(1.0)]);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_display_integral_numbers_have_no_point() {
        assert_eq!(Value::Number(3.0).to_string(), "3");
        assert_eq!(Value::Number(3.5).to_string(), "3.5");
        assert_eq!(Value::Number(-0.25).to_string(), "-0.25");
    }

    #[test]
    fn test_display_booleans_use_source_keywords() {
        assert_eq!(Value::Bool(true).to_string(), "goldberry");
        assert_eq!(Value::Bool(false).to_string(), "sauron");
    }

    #[test]
    fn test_display_collections() {
        let arr = Value::array(vec![Value::Number(1.0), Value::str("a")]);
        assert_eq!(arr.to_string(), "[1, a]");

        let mut entries = IndexMap::new();
        entries.insert("x".to_string(), Value::Number(1.0));
        entries.insert("y".to_string(), Value::Null);
        assert_eq!(Value::map(entries).to_string(), "{x: 1, y: null}");
    }
}
