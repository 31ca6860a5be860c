//! Dynamic references
//!
//! A [`RefHandle`] is a first-class handle to a variable. Plain variable
//! references hold their value directly; future variables hold a
//! [`FutureHandle`] that is created lazily on first use and assigned once.
//! When a register is captured as a reference, the frame keeps the handle in
//! the register's `VarInfo` and detaches it with [`RefHandle::dereference`]
//! when the register's scope is torn down.

use crate::vm::future::FutureHandle;
use crate::vm::interpreter::{ControlSignal, Frame, Target};
use crate::vm::object::ExceptionHandle;
use crate::vm::types::{ExceptionKind, TypeRegistry};
use crate::vm::value::Value;
use crate::vm::VmResult;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;

enum Slot {
    Var(Mutex<Option<Value>>),
    FutureVar(Mutex<Option<FutureHandle>>),
}

struct RefInner {
    name: Arc<str>,
    slot: Slot,
    attached: AtomicBool,
}

/// Shared handle to a variable
#[derive(Clone)]
pub struct RefHandle(Arc<RefInner>);

impl RefHandle {
    fn with_slot(name: impl Into<Arc<str>>, slot: Slot) -> Self {
        RefHandle(Arc::new(RefInner {
            name: name.into(),
            slot,
            attached: AtomicBool::new(true),
        }))
    }

    /// Reference to a plain variable, optionally pre-assigned
    pub fn var(name: impl Into<Arc<str>>, value: Option<Value>) -> Self {
        Self::with_slot(name, Slot::Var(Mutex::new(value)))
    }

    /// Forward reference backed by a future
    pub fn future_var(name: impl Into<Arc<str>>) -> Self {
        Self::with_slot(name, Slot::FutureVar(Mutex::new(None)))
    }

    /// Variable name (for diagnostics)
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Whether this is a future-backed reference
    pub fn is_future_var(&self) -> bool {
        matches!(self.0.slot, Slot::FutureVar(_))
    }

    /// Whether a value (or failure) is available
    pub fn is_assigned(&self) -> bool {
        match &self.0.slot {
            Slot::Var(v) => v.lock().is_some(),
            Slot::FutureVar(f) => f.lock().as_ref().map_or(false, FutureHandle::is_done),
        }
    }

    /// The backing future, if one exists yet
    pub fn future(&self) -> Option<FutureHandle> {
        match &self.0.slot {
            Slot::Var(_) => None,
            Slot::FutureVar(f) => f.lock().clone(),
        }
    }

    /// The backing future, created on first use
    ///
    /// Only the owning fiber creates the future, so the lazy creation does
    /// not race with other writers. Plain variables have no future.
    pub fn ensure_future(&self) -> Option<FutureHandle> {
        match &self.0.slot {
            Slot::Var(_) => None,
            Slot::FutureVar(f) => Some(f.lock().get_or_insert_with(FutureHandle::new).clone()),
        }
    }

    /// Read the referent
    ///
    /// A future variable that is not yet complete reads as `Pending`; a
    /// completed one yields its payload or its failure.
    pub fn get(&self, types: &TypeRegistry) -> Result<Poll<Value>, ExceptionHandle> {
        match &self.0.slot {
            Slot::Var(v) => match &*v.lock() {
                Some(value) => Ok(Poll::Ready(value.clone())),
                None => Err(self.unassigned(types)),
            },
            Slot::FutureVar(_) => match self.ensure_future().and_then(|f| f.poll()) {
                None => Ok(Poll::Pending),
                Some(Ok(value)) => Ok(Poll::Ready(value)),
                Some(Err(e)) => Err(e),
            },
        }
    }

    /// Assign the referent
    ///
    /// For future variables the first assignment establishes the value (or,
    /// when `value` is itself a future, the future's identity). Assigning a
    /// future to a reference whose own future is still pending connects the
    /// two; assigning to a completed one fails with "already set".
    pub fn set(&self, types: &TypeRegistry, value: Value) -> Result<(), ExceptionHandle> {
        match &self.0.slot {
            Slot::Var(v) => {
                *v.lock() = Some(value);
                Ok(())
            }
            Slot::FutureVar(slot) => {
                let mut slot = slot.lock();
                let current = slot.clone();
                match (current, value) {
                    (None, Value::Future(f)) => {
                        *slot = Some(f);
                        Ok(())
                    }
                    (None, value) => {
                        *slot = Some(FutureHandle::completed(value));
                        Ok(())
                    }
                    (Some(existing), _) if existing.is_done() => Err(self.already_set(types)),
                    (Some(existing), Value::Future(f)) => {
                        if !existing.ptr_eq(&f) {
                            f.connect(&existing);
                        }
                        Ok(())
                    }
                    (Some(existing), value) => existing
                        .complete(value)
                        .map_err(|_| self.already_set(types)),
                }
            }
        }
    }

    /// Detach from the register this reference was captured from
    ///
    /// The reference keeps its last value and becomes a standalone variable.
    pub fn dereference(&self) {
        self.0.attached.store(false, Ordering::Release);
    }

    /// Whether the reference still mirrors a live register
    pub fn is_attached(&self) -> bool {
        self.0.attached.load(Ordering::Acquire)
    }

    /// Assign the referent into `target`, suspending while it is pending
    ///
    /// Returns `Block` when the frame must wait for the backing future; the
    /// owning fiber is re-queued when it completes.
    pub fn wait_and_assign(&self, frame: &mut Frame, target: Target) -> VmResult<ControlSignal> {
        match self.ensure_future() {
            Some(future) => frame.await_future(future, target),
            None => match self.get(frame.context().types()) {
                Ok(Poll::Ready(value)) => frame.assign_value(target, value),
                Ok(Poll::Pending) => Ok(ControlSignal::Repeat),
                Err(e) => Ok(frame.raise_exception(e)),
            },
        }
    }

    /// Same reference identity
    pub fn ptr_eq(&self, other: &RefHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn unassigned(&self, types: &TypeRegistry) -> ExceptionHandle {
        types.exception(
            ExceptionKind::Unassigned,
            format!("Unassigned reference \"{}\"", self.0.name),
        )
    }

    fn already_set(&self, types: &TypeRegistry) -> ExceptionHandle {
        types.exception(
            ExceptionKind::IllegalState,
            format!("Future \"{}\" has already been set", self.0.name),
        )
    }
}

impl fmt::Debug for RefHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.slot {
            Slot::Var(v) => write!(f, "Ref({}: {:?})", self.0.name, v.lock()),
            Slot::FutureVar(fut) => write!(f, "FutureRef({}: {:?})", self.0.name, fut.lock()),
        }
    }
}
