//! Methods, call chains and function handles
//!
//! A [`CallChain`] is the resolved, most-derived-first list of
//! implementations of one method; the super implementation of any link is
//! simply the next one. A [`FunctionHandle`] is a chain plus an optional
//! bound target and bound parameters.

use super::frame::{Frame, ReturnTarget};
use super::ops::{Op, OpStream};
use super::signal::ControlSignal;
use crate::vm::object::Access;
use crate::vm::types::{Composition, ExceptionKind};
use crate::vm::value::Value;
use crate::vm::{VmError, VmResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Body of a natively implemented method
///
/// Called on the caller's frame; it either assigns its result to
/// `args.ret` synchronously, returns a deferred value through it, or
/// prepares a callee frame and returns `Call`.
pub type NativeFn = Arc<dyn Fn(&mut Frame, NativeArgs) -> VmResult<ControlSignal> + Send + Sync>;

/// Arguments passed to a native method
#[derive(Debug, Clone)]
pub struct NativeArgs {
    /// Bound target
    pub target: Option<Value>,
    /// Positional arguments
    pub args: Vec<Value>,
    /// Where the result goes in the calling frame
    pub ret: ReturnTarget,
}

impl NativeArgs {
    /// Argument `index`, `Null` if absent
    pub fn arg(&self, index: usize) -> Value {
        self.args.get(index).cloned().unwrap_or(Value::Null)
    }
}

/// Decoded op stream with its declared bounds
#[derive(Clone)]
pub struct Code {
    /// Ops
    pub ops: OpStream,
    /// Number of registers a frame running this code needs
    pub register_count: usize,
    /// Maximum scope depth (including the method scope)
    pub scope_count: usize,
}

impl Code {
    /// Create a code block
    pub fn new(ops: Vec<Arc<dyn Op>>, register_count: usize, scope_count: usize) -> Self {
        Self {
            ops: ops.into(),
            register_count,
            scope_count,
        }
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Code")
            .field("ops", &self.ops.len())
            .field("register_count", &self.register_count)
            .field("scope_count", &self.scope_count)
            .finish()
    }
}

/// How a method is implemented
#[derive(Clone)]
pub enum MethodBody {
    /// Interpreted ops
    Bytecode(Code),
    /// Native function
    Native(NativeFn),
}

/// Callable kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// Free function
    Function,
    /// Method dispatched on a target
    Method,
    /// Constructor; its target is the struct being built
    Constructor,
}

/// One method implementation
#[derive(Clone)]
pub struct Method {
    name: Arc<str>,
    owner: Option<Composition>,
    kind: MethodKind,
    arg_count: usize,
    body: MethodBody,
    finally: Option<Arc<Method>>,
}

impl Method {
    /// Interpreted function
    pub fn bytecode(name: impl Into<Arc<str>>, arg_count: usize, code: Code) -> Self {
        Self {
            name: name.into(),
            owner: None,
            kind: MethodKind::Function,
            arg_count,
            body: MethodBody::Bytecode(code),
            finally: None,
        }
    }

    /// Native function
    pub fn native(
        name: impl Into<Arc<str>>,
        arg_count: usize,
        f: impl Fn(&mut Frame, NativeArgs) -> VmResult<ControlSignal> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            owner: None,
            kind: MethodKind::Function,
            arg_count,
            body: MethodBody::Native(Arc::new(f)),
            finally: None,
        }
    }

    /// Set the callable kind
    pub fn with_kind(mut self, kind: MethodKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the owning composition
    pub fn with_owner(mut self, owner: Composition) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Attach a constructor `finally` block
    pub fn with_finally(mut self, finally: Arc<Method>) -> Self {
        self.finally = Some(finally);
        self
    }

    /// Name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning composition
    pub fn owner(&self) -> Option<&Composition> {
        self.owner.as_ref()
    }

    /// Callable kind
    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    /// Whether this is a constructor
    pub fn is_constructor(&self) -> bool {
        self.kind == MethodKind::Constructor
    }

    /// Declared parameter count
    pub fn arg_count(&self) -> usize {
        self.arg_count
    }

    /// Implementation
    pub fn body(&self) -> &MethodBody {
        &self.body
    }

    /// Bytecode, if interpreted
    pub fn code(&self) -> Option<&Code> {
        match &self.body {
            MethodBody::Bytecode(code) => Some(code),
            MethodBody::Native(_) => None,
        }
    }

    /// Constructor `finally` block
    pub fn finally(&self) -> Option<&Arc<Method>> {
        self.finally.as_ref()
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            MethodBody::Bytecode(code) => format!("{:?}", code),
            MethodBody::Native(_) => "native".to_string(),
        };
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("owner", &self.owner.as_ref().map(|c| c.name().to_string()))
            .field("kind", &self.kind)
            .field("arg_count", &self.arg_count)
            .field("body", &body)
            .finish()
    }
}

/// Resolved override sequence, most derived first
#[derive(Debug, Clone)]
pub struct CallChain {
    methods: Arc<[Arc<Method>]>,
    depth: usize,
}

impl CallChain {
    /// Create a chain; an empty chain is rejected
    pub fn new(methods: Vec<Arc<Method>>) -> VmResult<Self> {
        if methods.is_empty() {
            return Err(VmError::InvalidCall("empty call chain".into()));
        }
        Ok(Self {
            methods: methods.into(),
            depth: 0,
        })
    }

    /// Chain with a single implementation
    pub fn single(method: Arc<Method>) -> Self {
        Self {
            methods: Arc::from(vec![method]),
            depth: 0,
        }
    }

    /// Implementation this chain dispatches to
    pub fn top(&self) -> &Arc<Method> {
        &self.methods[self.depth]
    }

    /// The same chain positioned at the super implementation
    pub fn super_chain(&self) -> Option<CallChain> {
        (self.depth + 1 < self.methods.len()).then(|| CallChain {
            methods: self.methods.clone(),
            depth: self.depth + 1,
        })
    }

    /// Position in the chain (0 = most derived)
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Total number of implementations
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Always false; chains are never empty
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

struct FunctionInner {
    chain: CallChain,
    target: Option<Value>,
    /// Bound parameters as (absolute index, value), sorted by index
    bound: Vec<(usize, Value)>,
}

/// A callable value
#[derive(Clone)]
pub struct FunctionHandle(Arc<FunctionInner>);

impl FunctionHandle {
    /// Function for a single method
    pub fn new(method: Arc<Method>) -> Self {
        Self::from_chain(CallChain::single(method))
    }

    /// Function dispatching through `chain`
    pub fn from_chain(chain: CallChain) -> Self {
        FunctionHandle(Arc::new(FunctionInner {
            chain,
            target: None,
            bound: Vec::new(),
        }))
    }

    /// Bind a target, producing a method handle
    pub fn bind_target(&self, target: Value) -> Self {
        FunctionHandle(Arc::new(FunctionInner {
            chain: self.0.chain.clone(),
            target: Some(target),
            bound: self.0.bound.clone(),
        }))
    }

    /// Bind the `index`-th remaining parameter
    pub fn bind(&self, index: usize, value: Value) -> VmResult<Self> {
        let absolute = (0..self.method().arg_count())
            .filter(|i| !self.0.bound.iter().any(|(b, _)| b == i))
            .nth(index)
            .ok_or_else(|| {
                VmError::InvalidCall(format!(
                    "cannot bind parameter {} of {} ({} unbound)",
                    index,
                    self.method().name(),
                    self.arity()
                ))
            })?;
        let mut bound = self.0.bound.clone();
        let at = bound.partition_point(|(b, _)| *b < absolute);
        bound.insert(at, (absolute, value));
        Ok(FunctionHandle(Arc::new(FunctionInner {
            chain: self.0.chain.clone(),
            target: self.0.target.clone(),
            bound,
        })))
    }

    /// Number of parameters still to be supplied
    pub fn arity(&self) -> usize {
        self.method().arg_count() - self.0.bound.len()
    }

    /// Implementation called
    pub fn method(&self) -> &Arc<Method> {
        self.0.chain.top()
    }

    /// Call chain
    pub fn chain(&self) -> &CallChain {
        &self.0.chain
    }

    /// Bound target
    pub fn target(&self) -> Option<&Value> {
        self.0.target.as_ref()
    }

    fn merge_args(&self, args: Vec<Value>) -> Vec<Value> {
        if self.0.bound.is_empty() {
            return args;
        }
        let mut supplied = args.into_iter();
        let mut bound = self.0.bound.iter().peekable();
        (0..self.method().arg_count())
            .map(|i| match bound.peek() {
                Some((b, v)) if *b == i => {
                    bound.next();
                    v.clone()
                }
                _ => supplied.next().unwrap_or(Value::Null),
            })
            .collect()
    }

    /// Invoke from `frame`
    ///
    /// Native bodies run immediately on the calling frame; bytecode bodies
    /// get a new frame attached as the caller's next frame and `Call` is
    /// returned. A wrong argument count raises an exception.
    pub fn call(&self, frame: &mut Frame, args: Vec<Value>, ret: ReturnTarget) -> VmResult<ControlSignal> {
        if args.len() != self.arity() {
            return Ok(frame.raise_error(
                ExceptionKind::IllegalState,
                format!(
                    "{} expects {} arguments, got {}",
                    self.method().name(),
                    self.arity(),
                    args.len()
                ),
            ));
        }
        let args = self.merge_args(args);
        match self.method().body() {
            MethodBody::Native(f) => f(
                frame,
                NativeArgs {
                    target: self.0.target.clone(),
                    args,
                    ret,
                },
            ),
            MethodBody::Bytecode(_) => {
                let callee = Frame::new(
                    frame.context().clone(),
                    self.0.chain.clone(),
                    self.0.target.clone(),
                    args,
                    ret,
                )?;
                frame.set_next_frame(callee);
                Ok(ControlSignal::Call)
            }
        }
    }

    /// Invoke as a constructor taking part in the construction `frame`
    /// collects finalizers for
    ///
    /// The constructor's `finally` block (bound to the target and the same
    /// arguments) is chained onto `frame` before the body runs; the callee
    /// frame joins the same chain.
    pub fn construct(&self, frame: &mut Frame, args: Vec<Value>) -> VmResult<ControlSignal> {
        let method = self.method();
        if !method.is_constructor() {
            return Err(VmError::InvalidCall(format!("{} is not a constructor", method.name())));
        }
        let target = self
            .0
            .target
            .clone()
            .ok_or(VmError::NoTarget("constructor"))?;
        if let Some(finally) = method.finally() {
            let handle = FunctionHandle::new(finally.clone()).bind_target(target.with_access(Access::Private));
            frame.chain_finalizer(FullyBoundHandle::new(handle, self.merge_args(args.clone())))?;
        }
        let finalizers = frame.finalizers().cloned();
        let signal = self.call(frame, args, ReturnTarget::unused())?;
        if signal == ControlSignal::Call {
            if let (Some(chain), Some(callee)) = (finalizers, frame.next_frame_mut()) {
                callee.set_finalizers(chain);
            }
        }
        Ok(signal)
    }

    /// Same function identity
    pub fn ptr_eq(&self, other: &FunctionHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({}/{})", self.method().name(), self.arity())
    }
}

/// A function with every argument supplied
#[derive(Debug, Clone)]
pub struct FullyBoundHandle {
    function: FunctionHandle,
    args: Vec<Value>,
}

impl FullyBoundHandle {
    /// Bind `args` (the complete parameter list) to `function`
    pub fn new(function: FunctionHandle, args: Vec<Value>) -> Self {
        Self { function, args }
    }

    /// Function being called
    pub fn function(&self) -> &FunctionHandle {
        &self.function
    }

    /// Invoke from `frame`, discarding the result
    pub fn call(&self, frame: &mut Frame) -> VmResult<ControlSignal> {
        let function = FunctionHandle(Arc::new(FunctionInner {
            chain: self.function.0.chain.clone(),
            target: self.function.0.target.clone(),
            bound: Vec::new(),
        }));
        function.call(frame, self.args.clone(), ReturnTarget::unused())
    }
}

/// Finalizers collected while a construction runs
#[derive(Debug, Clone, Default)]
pub struct FinalizerChain(Arc<Mutex<Vec<FullyBoundHandle>>>);

impl FinalizerChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a finalizer
    pub fn push(&self, finalizer: FullyBoundHandle) {
        self.0.lock().push(finalizer);
    }

    /// Remove every finalizer, in registration order
    pub fn take(&self) -> Vec<FullyBoundHandle> {
        std::mem::take(&mut *self.0.lock())
    }

    /// Number of collected finalizers
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Whether nothing has been collected
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}
