//! Deferred values
//!
//! A [`FutureHandle`] is the only state shared between fibers. It is
//! assigned exactly once, either with a value or with an exception, and the
//! assignment is guarded by a mutex so that two fibers racing to complete the
//! same future resolve as "first write wins".

use crate::vm::object::ExceptionHandle;
use crate::vm::value::Value;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Result carried by a completed future
pub type Outcome = Result<Value, ExceptionHandle>;

type Callback = Box<dyn FnOnce(&Outcome) + Send>;

/// Second completion attempt on an already completed future
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Future has already been completed")]
pub struct AlreadyCompleted;

/// Observable completion state of a future
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Not completed yet
    Pending,
    /// Completed with a value
    Result,
    /// Completed exceptionally
    Error,
}

enum State {
    Pending(Vec<Callback>),
    Done(Outcome),
}

struct FutureInner {
    state: Mutex<State>,
    /// Synthetic stand-in for a value (async native result) rather than a
    /// first-class `Future` object
    deferred: bool,
}

/// Shared handle to a single-assignment future
#[derive(Clone)]
pub struct FutureHandle(Arc<FutureInner>);

impl FutureHandle {
    fn with_state(state: State, deferred: bool) -> Self {
        FutureHandle(Arc::new(FutureInner {
            state: Mutex::new(state),
            deferred,
        }))
    }

    /// Create a pending first-class future
    pub fn new() -> Self {
        Self::with_state(State::Pending(Vec::new()), false)
    }

    /// Create a pending deferred value
    ///
    /// Registers receiving a deferred value see its payload instead of the
    /// future itself.
    pub fn deferred() -> Self {
        Self::with_state(State::Pending(Vec::new()), true)
    }

    /// Create a future already completed with `value`
    pub fn completed(value: Value) -> Self {
        Self::with_state(State::Done(Ok(value)), false)
    }

    /// Create a future already failed with `exception`
    pub fn failed(exception: ExceptionHandle) -> Self {
        Self::with_state(State::Done(Err(exception)), false)
    }

    /// Whether this future is a synthetic deferred value
    pub fn is_deferred(&self) -> bool {
        self.0.deferred
    }

    /// Whether this future has been completed (either way)
    pub fn is_done(&self) -> bool {
        matches!(*self.0.state.lock(), State::Done(_))
    }

    /// Snapshot of the outcome, if completed
    pub fn poll(&self) -> Option<Outcome> {
        match &*self.0.state.lock() {
            State::Done(outcome) => Some(outcome.clone()),
            State::Pending(_) => None,
        }
    }

    /// Completion state
    pub fn completion(&self) -> Completion {
        match &*self.0.state.lock() {
            State::Pending(_) => Completion::Pending,
            State::Done(Ok(_)) => Completion::Result,
            State::Done(Err(_)) => Completion::Error,
        }
    }

    /// The failure, if completed exceptionally
    pub fn failure(&self) -> Option<ExceptionHandle> {
        match &*self.0.state.lock() {
            State::Done(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Complete with a value
    pub fn complete(&self, value: Value) -> Result<(), AlreadyCompleted> {
        self.resolve(Ok(value))
    }

    /// Complete exceptionally
    pub fn fail(&self, exception: ExceptionHandle) -> Result<(), AlreadyCompleted> {
        self.resolve(Err(exception))
    }

    /// Complete with an outcome
    ///
    /// Callbacks registered while pending run on the calling thread, after
    /// the state lock has been released.
    pub fn resolve(&self, outcome: Outcome) -> Result<(), AlreadyCompleted> {
        let callbacks = {
            let mut state = self.0.state.lock();
            match &mut *state {
                State::Done(_) => return Err(AlreadyCompleted),
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Done(outcome.clone());
                    callbacks
                }
            }
        };
        for callback in callbacks {
            callback(&outcome);
        }
        Ok(())
    }

    /// Register a completion callback
    ///
    /// If the future is already done the callback runs immediately.
    pub fn on_complete(&self, callback: impl FnOnce(&Outcome) + Send + 'static) {
        let outcome = {
            let mut state = self.0.state.lock();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Done(outcome) => outcome.clone(),
            }
        };
        callback(&outcome);
    }

    /// Chain a transformation, producing a new future for its result
    pub fn then(&self, f: impl FnOnce(&Outcome) -> Outcome + Send + 'static) -> FutureHandle {
        let chained = FutureHandle::new();
        let target = chained.clone();
        self.on_complete(move |outcome| {
            // `target` is private to this chain; nobody else can complete it
            let _ = target.resolve(f(outcome));
        });
        chained
    }

    /// Propagate this future's completion (success or failure) into `other`
    ///
    /// If `other` has been completed in the meantime, the propagated result
    /// is dropped.
    pub fn connect(&self, other: &FutureHandle) {
        let other = other.clone();
        self.on_complete(move |outcome| {
            if other.resolve(outcome.clone()).is_err() {
                tracing::debug!("connected future already completed, result dropped");
            }
        });
    }

    /// Same future identity
    pub fn ptr_eq(&self, other: &FutureHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for FutureHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FutureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.0.deferred { "Deferred" } else { "Future" };
        match &*self.0.state.lock() {
            State::Pending(_) => write!(f, "{}(Not completed)", kind),
            State::Done(Ok(v)) => write!(f, "{}(Completed: {:?})", kind, v),
            State::Done(Err(e)) => write!(f, "{}(Failed: {})", kind, e),
        }
    }
}
