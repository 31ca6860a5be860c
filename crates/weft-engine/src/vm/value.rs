//! Tagged runtime values
//!
//! Primitives are stored inline; everything else is a cheap-to-clone handle.
//! The execution core only needs to distinguish deferred values (futures
//! standing in for a result) and exceptions; the rest is carried opaquely.

use crate::vm::future::FutureHandle;
use crate::vm::interpreter::FunctionHandle;
use crate::vm::object::{Access, ExceptionHandle, ObjectHandle};
use crate::vm::reference::RefHandle;
use crate::vm::types::{Composition, TypeRegistry};
use std::fmt;
use std::sync::Arc;

/// A runtime value held in a register
#[derive(Clone)]
pub enum Value {
    /// The `Null` singleton
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// Immutable string
    Str(Arc<str>),
    /// Heap object view
    Object(ObjectHandle),
    /// Function or bound method
    Function(FunctionHandle),
    /// Future (deferred or first-class)
    Future(FutureHandle),
    /// First-class reference to a variable
    Ref(RefHandle),
    /// Exception
    Exception(ExceptionHandle),
    /// Immutable tuple
    Tuple(Arc<[Value]>),
    /// A composition used as a value (e.g. the type argument of `NEW`)
    Class(Composition),
}

impl Value {
    /// Create an integer value
    #[inline]
    pub fn int(i: i64) -> Self {
        Value::Int(i)
    }

    /// Create a boolean value
    #[inline]
    pub fn bool(b: bool) -> Self {
        Value::Bool(b)
    }

    /// Create a string value
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Value::Str(s.into())
    }

    /// Create a tuple value
    pub fn tuple(values: Vec<Value>) -> Self {
        Value::Tuple(values.into())
    }

    /// Check if this value is null
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Extract an integer
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Extract a boolean
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Extract a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Extract a future handle
    pub fn as_future(&self) -> Option<&FutureHandle> {
        match self {
            Value::Future(f) => Some(f),
            _ => None,
        }
    }

    /// Extract an exception handle
    pub fn as_exception(&self) -> Option<&ExceptionHandle> {
        match self {
            Value::Exception(e) => Some(e),
            _ => None,
        }
    }

    /// Extract a function handle
    pub fn as_function(&self) -> Option<&FunctionHandle> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Extract an object handle
    pub fn as_object(&self) -> Option<&ObjectHandle> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Extract a reference handle
    pub fn as_ref_handle(&self) -> Option<&RefHandle> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// True for a future that stands in for a not-yet-computed value
    pub fn is_deferred(&self) -> bool {
        matches!(self, Value::Future(f) if f.is_deferred())
    }

    /// Same value narrowed to `access`; non-objects are returned unchanged
    pub fn with_access(&self, access: Access) -> Value {
        match self {
            Value::Object(o) => Value::Object(o.ensure_access(access)),
            other => other.clone(),
        }
    }

    /// Runtime composition of this value
    pub fn composition(&self, types: &TypeRegistry) -> Composition {
        let b = types.builtins();
        match self {
            Value::Null => b.null.clone(),
            Value::Bool(_) => b.boolean.clone(),
            Value::Int(_) => b.int.clone(),
            Value::Str(_) => b.string.clone(),
            Value::Object(o) => o.composition().clone(),
            Value::Function(_) => b.function.clone(),
            Value::Future(_) => b.future.clone(),
            Value::Ref(_) => b.reference.clone(),
            Value::Exception(e) => e.composition().clone(),
            Value::Tuple(_) => b.tuple.clone(),
            Value::Class(_) => b.class.clone(),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl PartialEq for Value {
    /// Primitives compare by value, handles by identity
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Future(a), Value::Future(b)) => a.ptr_eq(b),
            (Value::Ref(a), Value::Ref(b)) => a.ptr_eq(b),
            (Value::Exception(a), Value::Exception(b)) => a.ptr_eq(b),
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Class(a), Value::Class(b)) => a == b,
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.into())
    }
}

impl From<ExceptionHandle> for Value {
    fn from(e: ExceptionHandle) -> Self {
        Value::Exception(e)
    }
}

impl From<FutureHandle> for Value {
    fn from(f: FutureHandle) -> Self {
        Value::Future(f)
    }
}

impl From<FunctionHandle> for Value {
    fn from(f: FunctionHandle) -> Self {
        Value::Function(f)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Object(o) => write!(f, "{:?}", o),
            Value::Function(func) => write!(f, "{:?}", func),
            Value::Future(fut) => write!(f, "{:?}", fut),
            Value::Ref(r) => write!(f, "{:?}", r),
            Value::Exception(e) => write!(f, "{:?}", e),
            Value::Tuple(items) => f.debug_tuple("").field(&items).finish(),
            Value::Class(c) => write!(f, "Class<{}>", c),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Exception(e) => write!(f, "{}", e),
            other => write!(f, "{:?}", other),
        }
    }
}
