//! Tagged values passed to and returned from task callables
//!
//! The scheduler never interprets a `Value` beyond cloning and moving it. The
//! variants cover what the runtime itself produces (native completions,
//! cancellation reasons) plus an `Opaque` escape hatch for foreign objects.

use crate::error::TaskError;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A dynamically-typed value
#[derive(Clone, Default)]
pub enum Value {
    /// Absence of a value
    #[default]
    Nil,
    /// Boolean
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// Immutable string
    Str(Arc<str>),
    /// Immutable byte buffer
    Bytes(Arc<[u8]>),
    /// Immutable sequence of values
    List(Arc<[Value]>),
    /// Foreign object handle, compared by identity
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Create an opaque value wrapping a foreign object
    pub fn opaque<T: Any + Send + Sync>(object: T) -> Self {
        Value::Opaque(Arc::new(object))
    }

    /// Create a list value
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(items.into_iter().collect())
    }

    /// Normalise into the argument sequence a callable receives.
    ///
    /// `Nil` becomes no arguments, a `List` is spread into its elements and
    /// any other value becomes a single argument.
    pub fn into_args(self) -> Vec<Value> {
        match self {
            Value::Nil => Vec::new(),
            Value::List(items) => items.to_vec(),
            other => vec![other],
        }
    }

    /// Integer payload, if any
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// String payload, if any
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Byte payload, if any
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Downcast an opaque payload
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Value::Opaque(obj) => obj.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Check if this is `Nil`
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            Value::List(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Opaque(obj) => write!(f, "opaque@{:p}", Arc::as_ptr(obj)),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(Arc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(Arc::from(v))
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(Arc::from(v))
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(Arc::from(v))
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

/// The invocation contract of compiled/native functions: a value sequence in,
/// a value sequence or an exception out.
pub type Callable = Arc<dyn Fn(Vec<Value>) -> Result<Vec<Value>, TaskError> + Send + Sync>;

/// Wrap a closure as a [`Callable`]
pub fn callable<F>(f: F) -> Callable
where
    F: Fn(Vec<Value>) -> Result<Vec<Value>, TaskError> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_args_normalisation() {
        assert!(Value::Nil.into_args().is_empty());
        assert_eq!(Value::Int(7).into_args(), vec![Value::Int(7)]);
        assert_eq!(
            Value::list([Value::Int(1), Value::from("a")]).into_args(),
            vec![Value::Int(1), Value::from("a")]
        );
    }

    #[test]
    fn test_opaque_identity_equality() {
        let a = Value::opaque(5u32);
        let b = a.clone();
        let c = Value::opaque(5u32);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.downcast_ref::<u32>(), Some(&5));
    }

    #[test]
    fn test_callable_invocation() {
        let double = callable(|args| {
            let n = args.first().and_then(Value::as_int).unwrap_or(0);
            Ok(vec![Value::Int(n * 2)])
        });
        assert_eq!(double(vec![Value::Int(21)]).unwrap(), vec![Value::Int(42)]);
    }
}
