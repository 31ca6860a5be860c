//! Fiber structure and dispatch loop

use crate::vm::future::FutureHandle;
use crate::vm::interpreter::{
    ops, Arg, ControlSignal, Frame, FunctionHandle, Op, Predefined, ReturnTarget, Returned,
    ServiceContext, Target,
};
use crate::vm::object::ExceptionHandle;
use crate::vm::types::ExceptionKind;
use crate::vm::value::Value;
use crate::vm::{VmError, VmResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Unique identifier for a Fiber
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    /// Generate a new unique FiberId
    pub fn new() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for FiberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a Fiber
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FiberState {
    /// Just created, not yet run
    Created,
    /// Currently executing on a worker
    Running,
    /// Waiting on a future
    Parked,
    /// Ready to run again (woken or yielded)
    Resumed,
    /// Completed with a result
    Completed,
    /// Terminated by an uncaught exception or a fatal error
    Failed,
}

/// Outcome of one [`Fiber::execute`] slice
#[derive(Debug, Clone)]
pub enum FiberStatus {
    /// Returned normally
    Completed(Value),
    /// Terminated by an uncaught exception
    Failed(ExceptionHandle),
    /// Terminated by a protocol violation
    Aborted(VmError),
    /// Waiting on a future; re-queued when it completes
    Parked,
    /// Gave up the worker voluntarily; must be re-queued
    Yielded,
}

enum Exit {
    Completed(Value),
    Failed(ExceptionHandle),
    Park,
    Yield,
}

/// A cooperatively scheduled thread of execution
pub struct Fiber {
    id: FiberId,
    name: Arc<str>,
    context: Arc<ServiceContext>,
    state: Mutex<FiberState>,
    frames: Mutex<Vec<Frame>>,
    // Futures holding a wake callback for this fiber
    subscribed: Mutex<Vec<FutureHandle>>,
    result: FutureHandle,
}

impl Fiber {
    /// Create a fiber that calls `function` with `args`
    ///
    /// The bottom frame is a native frame that performs the call and
    /// returns whatever the function returned.
    pub(crate) fn new(
        context: Arc<ServiceContext>,
        function: FunctionHandle,
        args: Vec<Value>,
    ) -> Arc<Fiber> {
        let ops: Vec<Arc<dyn Op>> = vec![
            Arc::new(ops::Call {
                function: Arg::Register(0),
                args: (1..=args.len()).map(Arg::Register).collect(),
                ret: ReturnTarget::Single(Target::Local),
            }),
            Arc::new(ops::Return {
                value: Arg::Predefined(Predefined::Local),
            }),
        ];
        let name: Arc<str> = Arc::from(function.method().name());
        let mut registers = Vec::with_capacity(args.len() + 1);
        registers.push(Value::Function(function));
        registers.extend(args);

        let mut root = Frame::native(context.clone(), ops.into(), registers, 1);
        root.force_value(Target::Local, Value::Null);

        Arc::new(Fiber {
            id: FiberId::new(),
            name,
            context,
            state: Mutex::new(FiberState::Created),
            frames: Mutex::new(vec![root]),
            subscribed: Mutex::new(Vec::new()),
            result: FutureHandle::new(),
        })
    }

    /// Fiber id
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Name of the function the fiber runs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> FiberState {
        *self.state.lock()
    }

    /// Whether the fiber has terminated
    pub fn is_terminated(&self) -> bool {
        matches!(self.state(), FiberState::Completed | FiberState::Failed)
    }

    /// Future completed with the fiber's return value, or failed with the
    /// exception that terminated it
    pub fn result(&self) -> FutureHandle {
        self.result.clone()
    }

    /// Service the fiber runs in
    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.context
    }

    /// Render the frame stack, innermost first
    pub fn stack_trace(&self) -> String {
        match self.frames.try_lock() {
            Some(frames) => render_stack(&frames),
            None => format!("<fiber {} is running>", self.id),
        }
    }

    /// Wake a parked fiber
    ///
    /// Called from future completion callbacks; waking a fiber that is not
    /// parked is a no-op.
    pub fn on_response(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != FiberState::Parked {
                return;
            }
            *state = FiberState::Resumed;
        }
        debug!(fiber = %self.id, "fiber woken");
        self.context.queue().push(self.clone());
    }

    /// Number of futures currently holding a wake callback for this fiber
    pub fn subscriptions(&self) -> usize {
        self.subscribed.lock().len()
    }

    /// Register wake callbacks on `pending`, skipping futures that already
    /// hold one
    ///
    /// A callback unsubscribes before waking, so a future that completes
    /// after being skipped still wakes the parked fiber.
    fn subscribe(self: &Arc<Self>, pending: Vec<FutureHandle>) {
        let fresh: Vec<FutureHandle> = {
            let mut subscribed = self.subscribed.lock();
            pending
                .into_iter()
                .filter(|future| {
                    if subscribed.iter().any(|s| s.ptr_eq(future)) {
                        return false;
                    }
                    subscribed.push(future.clone());
                    true
                })
                .collect()
        };
        for future in fresh {
            let fiber = self.clone();
            let key = future.clone();
            future.on_complete(move |_| {
                fiber.subscribed.lock().retain(|s| !s.ptr_eq(&key));
                fiber.on_response();
            });
        }
    }

    /// Run the fiber until it terminates, parks or yields
    pub fn execute(self: &Arc<Self>) -> FiberStatus {
        let resuming = {
            let mut state = self.state.lock();
            let resuming = match *state {
                FiberState::Created => false,
                FiberState::Parked | FiberState::Resumed => true,
                other => {
                    return FiberStatus::Aborted(VmError::InvalidState(format!(
                        "fiber {} cannot run while {:?}",
                        self.id, other
                    )))
                }
            };
            *state = FiberState::Running;
            resuming
        };
        if resuming {
            debug!(fiber = %self.id, "fiber resumed");
        }

        let mut frames = self.frames.lock();
        match self.run(&mut frames, resuming) {
            Ok(Exit::Completed(value)) => {
                frames.clear();
                drop(frames);
                *self.state.lock() = FiberState::Completed;
                debug!(fiber = %self.id, function = %self.name, "fiber completed");
                if self.result.complete(value.clone()).is_err() {
                    debug!(fiber = %self.id, "fiber result was already set");
                }
                FiberStatus::Completed(value)
            }
            Ok(Exit::Failed(exception)) => {
                frames.clear();
                drop(frames);
                *self.state.lock() = FiberState::Failed;
                error!(
                    fiber = %self.id,
                    function = %self.name,
                    exception = %exception,
                    trace = exception.stack_trace().unwrap_or(""),
                    "fiber terminated by uncaught exception"
                );
                let _ = self.result.fail(exception.clone());
                FiberStatus::Failed(exception)
            }
            Ok(Exit::Park) => {
                let pending = frames.last().map(Frame::pending_futures).unwrap_or_default();
                drop(frames);
                if pending.is_empty() {
                    *self.state.lock() = FiberState::Resumed;
                    return FiberStatus::Yielded;
                }
                *self.state.lock() = FiberState::Parked;
                debug!(fiber = %self.id, waiting = pending.len(), "fiber parked");
                self.subscribe(pending);
                FiberStatus::Parked
            }
            Ok(Exit::Yield) => {
                drop(frames);
                *self.state.lock() = FiberState::Resumed;
                FiberStatus::Yielded
            }
            Err(err) => {
                for mut frame in frames.drain(..).rev() {
                    frame.release_all();
                }
                drop(frames);
                *self.state.lock() = FiberState::Failed;
                error!(fiber = %self.id, function = %self.name, error = %err, "fiber aborted");
                let exception = self
                    .context
                    .types()
                    .exception(ExceptionKind::IllegalState, format!("Fatal: {}", err));
                let _ = self.result.fail(exception);
                FiberStatus::Aborted(err)
            }
        }
    }

    fn run(&self, frames: &mut Vec<Frame>, resuming: bool) -> VmResult<Exit> {
        if resuming {
            let frame = frames
                .last_mut()
                .ok_or(VmError::MissingFrame("resumed fiber has no frames"))?;
            let signal = match frame.check_waiting_registers()? {
                ControlSignal::Block => return Ok(Exit::Park),
                ControlSignal::Exception => {
                    frame.take_continuation();
                    Some(ControlSignal::Exception)
                }
                _ => match frame.take_continuation() {
                    Some(continuation) => Some(continuation(frame)?),
                    None => None,
                },
            };
            if let Some(signal) = signal {
                if let Some(exit) = self.dispatch(frames, signal, false)? {
                    return Ok(exit);
                }
            }
        }

        let trace_ops = self.context.options().trace_ops;
        loop {
            let frame = frames
                .last_mut()
                .ok_or(VmError::MissingFrame("fiber has no frames"))?;
            let pc = frame.pc();
            let op = frame.op(pc)?;
            if trace_ops {
                trace!(fiber = %self.id, depth = frames.len(), pc, op = op.name(), "dispatch");
            }
            let frame = frames
                .last_mut()
                .ok_or(VmError::MissingFrame("fiber has no frames"))?;
            let signal = op.process(frame, pc)?;
            if let Some(exit) = self.dispatch(frames, signal, true)? {
                return Ok(exit);
            }
        }
    }

    /// Act on a control signal
    ///
    /// `from_op` is set when the signal came straight from an op, in which
    /// case a completed op moves the program counter forward. Signals from
    /// continuations and resumed waits leave it where it is.
    fn dispatch(
        &self,
        frames: &mut Vec<Frame>,
        mut signal: ControlSignal,
        mut from_op: bool,
    ) -> VmResult<Option<Exit>> {
        loop {
            let frame = frames
                .last_mut()
                .ok_or(VmError::MissingFrame("signal on an empty fiber"))?;
            match signal {
                ControlSignal::Next => {
                    if from_op {
                        frame.set_pc(frame.pc() + 1);
                    }
                    return Ok(None);
                }
                ControlSignal::Jump(address) => {
                    frame.set_pc(address);
                    return Ok(None);
                }
                ControlSignal::Repeat => {
                    return Ok(Some(if frame.is_waiting() {
                        Exit::Park
                    } else {
                        Exit::Yield
                    }));
                }
                ControlSignal::Block | ControlSignal::BlockReturn => {
                    if from_op {
                        frame.set_pc(frame.pc() + 1);
                    }
                    return Ok(Some(Exit::Park));
                }
                ControlSignal::Call => {
                    if from_op {
                        frame.set_pc(frame.pc() + 1);
                    }
                    let callee = frame
                        .take_next_frame()
                        .ok_or(VmError::MissingFrame("call without a callee frame"))?;
                    let limit = self.context.options().max_frame_depth;
                    if frames.len() >= limit {
                        let frame = frames
                            .last_mut()
                            .ok_or(VmError::MissingFrame("signal on an empty fiber"))?;
                        frame.take_continuation();
                        signal = frame.raise_error(
                            ExceptionKind::StackOverflow,
                            format!("Frame depth exceeds {}", limit),
                        );
                        from_op = false;
                        continue;
                    }
                    frames.push(callee);
                    return Ok(None);
                }
                ControlSignal::Return | ControlSignal::ReturnException => {
                    let mut callee = frames
                        .pop()
                        .ok_or(VmError::MissingFrame("return from an empty fiber"))?;
                    let mut returned = callee.take_returned();
                    if returned.is_none() {
                        returned = callee.take_exception().map(Returned::Exception);
                    }
                    callee.release_all();

                    let Some(caller) = frames.last_mut() else {
                        return Ok(Some(match returned {
                            None => Exit::Completed(Value::Null),
                            Some(Returned::Value(value)) => Exit::Completed(value),
                            Some(Returned::Tuple(values)) | Some(Returned::Multi(values)) => {
                                Exit::Completed(Value::tuple(values))
                            }
                            Some(Returned::Exception(e)) => Exit::Failed(e),
                        }));
                    };
                    match caller.accept_return(returned, callee.return_target())? {
                        ControlSignal::ReturnException => {
                            caller.take_continuation();
                            signal = ControlSignal::Exception;
                            from_op = false;
                        }
                        ControlSignal::BlockReturn => return Ok(Some(Exit::Park)),
                        _ => match caller.take_continuation() {
                            Some(continuation) => {
                                signal = continuation(caller)?;
                                from_op = false;
                            }
                            None => return Ok(None),
                        },
                    }
                }
                ControlSignal::Exception => {
                    let exception = frame.take_exception().ok_or_else(|| {
                        VmError::InvalidState("exception signal without an exception".into())
                    })?;
                    exception.record_stack_trace(|| render_stack(frames.as_slice()));

                    let frame = frames
                        .last_mut()
                        .ok_or(VmError::MissingFrame("signal on an empty fiber"))?;
                    let exception = if frame.guard_depth() > 0 {
                        if let ControlSignal::Jump(address) = frame.find_guard(exception)? {
                            frame.set_pc(address);
                            return Ok(None);
                        }
                        frame.take_exception().ok_or_else(|| {
                            VmError::InvalidState("unhandled exception was dropped".into())
                        })?
                    } else {
                        exception
                    };

                    if let Some(mut unwound) = frames.pop() {
                        trace!(fiber = %self.id, frame = %unwound, "frame unwound");
                        unwound.release_all();
                    }
                    let Some(caller) = frames.last_mut() else {
                        return Ok(Some(Exit::Failed(exception)));
                    };
                    caller.take_continuation();
                    signal = caller.raise_exception(exception);
                    from_op = false;
                }
            }
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

fn render_stack(frames: &[Frame]) -> String {
    frames
        .iter()
        .rev()
        .map(|frame| format!("  at {}", frame))
        .collect::<Vec<_>>()
        .join("\n")
}
