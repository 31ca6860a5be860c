//! Object and exception handles
//!
//! An `ObjectHandle` is a view of a shared instance narrowed to an access
//! level; narrowing never copies the instance. An `ExceptionHandle` is the
//! only currency of user-level failure in the core.

use crate::vm::types::Composition;
use crate::vm::value::Value;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Access level of an object view
///
/// `Struct` is the construction-phase view handed to constructors; fields are
/// not yet finalized.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Access {
    /// Construction-phase view
    Struct,
    /// `this:private`
    Private,
    /// `this:protected`
    Protected,
    /// `this:public`
    Public,
}

struct ObjectInner {
    composition: Composition,
    fields: Mutex<Vec<Value>>,
}

/// Handle to a heap object narrowed to an access level
#[derive(Clone)]
pub struct ObjectHandle {
    inner: Arc<ObjectInner>,
    access: Access,
}

impl ObjectHandle {
    /// Allocate a new instance in its construction phase (`Access::Struct`)
    pub fn new(composition: Composition) -> Self {
        let fields = vec![Value::Null; composition.field_count()];
        Self {
            inner: Arc::new(ObjectInner {
                composition,
                fields: Mutex::new(fields),
            }),
            access: Access::Struct,
        }
    }

    /// Composition of the instance
    pub fn composition(&self) -> &Composition {
        &self.inner.composition
    }

    /// Access level of this view
    pub fn access(&self) -> Access {
        self.access
    }

    /// Same instance viewed at another access level
    pub fn ensure_access(&self, access: Access) -> Self {
        Self {
            inner: self.inner.clone(),
            access,
        }
    }

    /// Read a field
    pub fn field(&self, index: usize) -> Option<Value> {
        self.inner.fields.lock().get(index).cloned()
    }

    /// Write a field; returns false when the index is out of range
    pub fn set_field(&self, index: usize, value: Value) -> bool {
        match self.inner.fields.lock().get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Identity comparison (ignores access level)
    pub fn ptr_eq(&self, other: &ObjectHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}:{:?})", self.composition(), self.access)
    }
}

struct ExceptionInner {
    composition: Composition,
    message: String,
    cause: Option<ExceptionHandle>,
    stack_trace: OnceCell<String>,
}

/// A raised (or raisable) user-level exception
#[derive(Clone)]
pub struct ExceptionHandle(Arc<ExceptionInner>);

impl ExceptionHandle {
    /// Create an exception of the given composition
    pub fn new(composition: Composition, message: impl Into<String>) -> Self {
        Self(Arc::new(ExceptionInner {
            composition,
            message: message.into(),
            cause: None,
            stack_trace: OnceCell::new(),
        }))
    }

    /// Create an exception wrapping a cause
    pub fn with_cause(
        composition: Composition,
        message: impl Into<String>,
        cause: ExceptionHandle,
    ) -> Self {
        Self(Arc::new(ExceptionInner {
            composition,
            message: message.into(),
            cause: Some(cause),
            stack_trace: OnceCell::new(),
        }))
    }

    /// Runtime type of the exception
    pub fn composition(&self) -> &Composition {
        &self.0.composition
    }

    /// Message text
    pub fn message(&self) -> &str {
        &self.0.message
    }

    /// Wrapped cause
    pub fn cause(&self) -> Option<&ExceptionHandle> {
        self.0.cause.as_ref()
    }

    /// Rendered frame chain captured when the exception first unwound
    pub fn stack_trace(&self) -> Option<&str> {
        self.0.stack_trace.get().map(String::as_str)
    }

    /// Record the stack trace; only the first recording sticks
    pub fn record_stack_trace(&self, trace: impl FnOnce() -> String) {
        let _ = self.0.stack_trace.get_or_init(trace);
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &ExceptionHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ExceptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.composition(), self.message())
    }
}

impl fmt::Display for ExceptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.composition(), self.message())?;
        if let Some(cause) = self.cause() {
            write!(f, " (caused by {})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for ExceptionHandle {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::types::TypeRegistry;

    #[test]
    fn test_access_narrowing_shares_instance() {
        let types = TypeRegistry::new();
        let point = types.register("Point", None, 2).unwrap();
        let raw = ObjectHandle::new(point);
        assert_eq!(raw.access(), Access::Struct);

        assert!(raw.set_field(0, Value::int(3)));
        let public = raw.ensure_access(Access::Public);
        assert_eq!(public.access(), Access::Public);
        assert!(public.ptr_eq(&raw));
        assert_eq!(public.field(0), Some(Value::int(3)));
        assert!(!public.set_field(5, Value::Null));
    }

    #[test]
    fn test_stack_trace_recorded_once() {
        let types = TypeRegistry::new();
        let e = ExceptionHandle::new(types.builtins().exception.clone(), "boom");
        assert!(e.stack_trace().is_none());
        e.record_stack_trace(|| "first".to_string());
        e.record_stack_trace(|| "second".to_string());
        assert_eq!(e.stack_trace(), Some("first"));
    }

    #[test]
    fn test_display_with_cause() {
        let types = TypeRegistry::new();
        let b = types.builtins();
        let cause = ExceptionHandle::new(b.arithmetic.clone(), "divide by zero");
        let e = ExceptionHandle::with_cause(b.illegal_state.clone(), "failed", cause);
        assert_eq!(
            e.to_string(),
            "IllegalStateException: failed (caused by ArithmeticException: divide by zero)"
        );
    }
}
