//! Activation records
//!
//! A [`Frame`] owns the registers, variable metadata, scope table and guard
//! stack of one invocation. Frames never point at each other: the owning
//! fiber keeps them in a stack and hands callee results to the caller, so the
//! only links a frame carries are the callee it has just prepared
//! (`next_frame`) and the continuation to run once that callee returns.

use super::call_chain::{CallChain, FinalizerChain, FullyBoundHandle, FunctionHandle, Method};
use super::context::ServiceContext;
use super::guard::{Catch, Guard};
use super::ops::{Op, OpStream};
use super::signal::{ControlSignal, Fault};
use crate::vm::future::FutureHandle;
use crate::vm::object::{Access, ExceptionHandle};
use crate::vm::reference::RefHandle;
use crate::vm::types::{Composition, ExceptionKind};
use crate::vm::value::Value;
use crate::vm::{VmError, VmResult};
use std::fmt;
use std::sync::Arc;
use std::task::Poll;

/// Arguments that are not registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predefined {
    /// The frame-local scratch value
    Local,
    /// The target as passed in
    Target,
    /// Public view of the target
    Public,
    /// Protected view of the target
    Protected,
    /// Private view of the target
    Private,
    /// Struct view of the target
    Struct,
    /// The super implementation of the running method, bound to the target
    Super,
    /// The service the frame runs in
    Service,
}

impl Predefined {
    fn describe(self) -> &'static str {
        match self {
            Predefined::Local => "local",
            Predefined::Target => "this",
            Predefined::Public => "this:public",
            Predefined::Protected => "this:protected",
            Predefined::Private => "this:private",
            Predefined::Struct => "this:struct",
            Predefined::Super => "super",
            Predefined::Service => "this:service",
        }
    }
}

/// An op argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    /// Register index
    Register(usize),
    /// Constant pool id
    Const(u32),
    /// Predefined value
    Predefined(Predefined),
}

impl From<usize> for Arg {
    fn from(index: usize) -> Self {
        Arg::Register(index)
    }
}

/// Where an op writes its result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Register index
    Register(usize),
    /// Result is discarded
    Unused,
    /// Marker for a multi-value return; never a valid assignment target
    Multi,
    /// The frame-local scratch value
    Local,
}

/// Where a callee's result lands in the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnTarget {
    /// One target
    Single(Target),
    /// One target per returned value
    Multi(Arc<[Target]>),
}

impl ReturnTarget {
    /// Discard the result
    pub fn unused() -> Self {
        ReturnTarget::Single(Target::Unused)
    }

    /// Return into a register
    pub fn register(index: usize) -> Self {
        ReturnTarget::Single(Target::Register(index))
    }
}

impl From<Target> for ReturnTarget {
    fn from(target: Target) -> Self {
        ReturnTarget::Single(target)
    }
}

/// How a register's value is read and written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarStyle {
    /// Value stored directly
    Standard,
    /// The register holds a `RefHandle`; reads and writes go through it
    DynamicRef,
    /// The register is waiting on a future
    Waiting,
}

/// Metadata for an occupied register
#[derive(Debug, Clone)]
pub struct VarInfo {
    composition: Option<Composition>,
    name: Arc<str>,
    style: VarStyle,
    resume_style: VarStyle,
    live_ref: Option<RefHandle>,
}

impl VarInfo {
    /// Create metadata for a register
    pub fn new(composition: Option<Composition>, name: impl Into<Arc<str>>, style: VarStyle) -> Self {
        Self {
            composition,
            name: name.into(),
            style,
            resume_style: style,
            live_ref: None,
        }
    }

    /// Declared composition, if known
    pub fn composition(&self) -> Option<&Composition> {
        self.composition.as_ref()
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current style
    pub fn style(&self) -> VarStyle {
        self.style
    }

    /// Whether the register is waiting on a future
    pub fn is_waiting(&self) -> bool {
        self.style == VarStyle::Waiting
    }

    /// Reference handed out for this register, if it has been captured
    pub fn live_ref(&self) -> Option<&RefHandle> {
        self.live_ref.as_ref()
    }

    fn wait(&mut self) {
        if self.style != VarStyle::Waiting {
            self.resume_style = self.style;
            self.style = VarStyle::Waiting;
        }
    }

    fn stop_waiting(&mut self) {
        self.style = self.resume_style;
    }

    /// Tear down the register's metadata, detaching any captured reference
    pub fn release(self) {
        if let Some(r) = self.live_ref {
            r.dereference();
        }
    }
}

/// Result staged by a completed frame for its caller
#[derive(Debug, Clone)]
pub enum Returned {
    /// Single value
    Value(Value),
    /// Several values packed into one tuple
    Tuple(Vec<Value>),
    /// Several values, one per caller target
    Multi(Vec<Value>),
    /// Exception delivered as the call's result
    Exception(ExceptionHandle),
}

pub(crate) type Continuation = Box<dyn FnOnce(&mut Frame) -> VmResult<ControlSignal> + Send>;

/// One activation record
pub struct Frame {
    context: Arc<ServiceContext>,
    chain: Option<CallChain>,
    ops: OpStream,
    target: Option<Value>,
    registers: Vec<Option<Value>>,
    infos: Vec<Option<VarInfo>>,
    /// First free register per scope depth
    pub(crate) next_var: Vec<usize>,
    pub(crate) scope: usize,
    pub(crate) guards: Vec<Guard>,
    pc: usize,
    pub(crate) exception: Option<ExceptionHandle>,
    frame_local: Option<Value>,
    arg_end: usize,
    return_target: ReturnTarget,
    returned: Option<Returned>,
    next_frame: Option<Box<Frame>>,
    continuation: Option<Continuation>,
    finalizers: Option<FinalizerChain>,
    waiting: Vec<(FutureHandle, Target)>,
}

impl Frame {
    /// Create a frame for the top method of `chain`
    ///
    /// With a target, register 0 holds it (narrowed to `Private`, or to
    /// `Struct` for constructors) and arguments start at register 1.
    pub fn new(
        context: Arc<ServiceContext>,
        chain: CallChain,
        target: Option<Value>,
        args: Vec<Value>,
        return_target: ReturnTarget,
    ) -> VmResult<Frame> {
        let method = chain.top().clone();
        let code = method
            .code()
            .ok_or_else(|| VmError::InvalidCall(format!("{} has no bytecode body", method.name())))?;
        if args.len() != method.arg_count() {
            return Err(VmError::InvalidCall(format!(
                "{} expects {} arguments, got {}",
                method.name(),
                method.arg_count(),
                args.len()
            )));
        }

        let offset = usize::from(target.is_some());
        let arg_end = offset + args.len();
        if arg_end > code.register_count {
            return Err(VmError::RegisterOutOfRange {
                index: arg_end - 1,
                count: code.register_count,
            });
        }

        let mut registers = vec![None; code.register_count];
        if let Some(t) = &target {
            let access = if method.is_constructor() {
                Access::Struct
            } else {
                Access::Private
            };
            registers[0] = Some(t.with_access(access));
        }
        for (i, arg) in args.into_iter().enumerate() {
            registers[offset + i] = Some(arg);
        }

        let mut next_var = vec![0; code.scope_count.max(1)];
        next_var[0] = arg_end;

        Ok(Frame {
            context,
            ops: code.ops.clone(),
            chain: Some(chain),
            target,
            infos: vec![None; registers.len()],
            registers,
            next_var,
            scope: 0,
            guards: Vec::new(),
            pc: 0,
            exception: None,
            frame_local: None,
            arg_end,
            return_target,
            returned: None,
            next_frame: None,
            continuation: None,
            finalizers: None,
            waiting: Vec::new(),
        })
    }

    /// Create a frame with no method behind it
    ///
    /// Used for the bottom frame of a fiber. `registers` are pre-assigned
    /// and `scope_count` bounds the nesting depth.
    pub fn native(
        context: Arc<ServiceContext>,
        ops: OpStream,
        registers: Vec<Value>,
        scope_count: usize,
    ) -> Frame {
        let arg_end = registers.len();
        let registers: Vec<Option<Value>> = registers.into_iter().map(Some).collect();
        let mut next_var = vec![0; scope_count.max(1)];
        next_var[0] = arg_end;
        Frame {
            context,
            chain: None,
            ops,
            target: None,
            infos: vec![None; registers.len()],
            registers,
            next_var,
            scope: 0,
            guards: Vec::new(),
            pc: 0,
            exception: None,
            frame_local: None,
            arg_end,
            return_target: ReturnTarget::unused(),
            returned: None,
            next_frame: None,
            continuation: None,
            finalizers: None,
            waiting: Vec::new(),
        }
    }

    // ===== accessors =====

    /// Service this frame runs in
    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.context
    }

    /// Running method (absent for native frames)
    pub fn method(&self) -> Option<&Arc<Method>> {
        self.chain.as_ref().map(CallChain::top)
    }

    /// Call chain the running method was resolved from
    pub fn chain(&self) -> Option<&CallChain> {
        self.chain.as_ref()
    }

    /// Target as passed in
    pub fn target(&self) -> Option<&Value> {
        self.target.as_ref()
    }

    /// Op at `pc`
    pub fn op(&self, pc: usize) -> VmResult<Arc<dyn Op>> {
        self.ops.get(pc).cloned().ok_or(VmError::PcOutOfRange {
            pc,
            len: self.ops.len(),
        })
    }

    /// Program counter
    pub fn pc(&self) -> usize {
        self.pc
    }

    pub(crate) fn set_pc(&mut self, pc: usize) {
        self.pc = pc;
    }

    /// Current scope depth
    pub fn scope(&self) -> usize {
        self.scope
    }

    /// Number of active guards
    pub fn guard_depth(&self) -> usize {
        self.guards.len()
    }

    /// Number of registers
    pub fn register_count(&self) -> usize {
        self.registers.len()
    }

    /// First free register in the current scope
    pub fn next_var(&self) -> usize {
        self.next_var[self.scope]
    }

    /// Raw register content, without any deferred or reference resolution
    pub fn register(&self, index: usize) -> Option<&Value> {
        self.registers.get(index).and_then(Option::as_ref)
    }

    /// Metadata of a register, if it has been introduced
    pub fn var_info(&self, index: usize) -> Option<&VarInfo> {
        self.infos.get(index).and_then(Option::as_ref)
    }

    /// Pending exception
    pub fn exception(&self) -> Option<&ExceptionHandle> {
        self.exception.as_ref()
    }

    /// Remove and return the pending exception
    pub fn take_exception(&mut self) -> Option<ExceptionHandle> {
        self.exception.take()
    }

    /// Frame-local scratch value
    pub fn frame_local(&self) -> Option<&Value> {
        self.frame_local.as_ref()
    }

    /// Where this frame's result goes in the caller
    pub fn return_target(&self) -> &ReturnTarget {
        &self.return_target
    }

    fn check_index(&self, index: usize) -> VmResult<()> {
        if index < self.registers.len() {
            Ok(())
        } else {
            Err(VmError::RegisterOutOfRange {
                index,
                count: self.registers.len(),
            })
        }
    }

    /// Create a standard exception of `kind`
    pub fn new_exception(&self, kind: ExceptionKind, message: impl Into<String>) -> ExceptionHandle {
        self.context.types().exception(kind, message)
    }

    // ===== variables =====

    /// Bind metadata (and optionally a value) to a register
    ///
    /// The value is stored as is; for `DynamicRef` registers it is the
    /// reference itself.
    pub fn introduce_var(
        &mut self,
        index: usize,
        composition: Option<Composition>,
        name: impl Into<Arc<str>>,
        style: VarStyle,
        value: Option<Value>,
    ) -> VmResult<()> {
        self.check_index(index)?;
        if self.infos[index].is_some() {
            return Err(VmError::InvalidState(format!(
                "register {} is already introduced",
                index
            )));
        }
        self.infos[index] = Some(VarInfo::new(composition, name, style));
        if value.is_some() {
            self.registers[index] = value;
        }
        let next = &mut self.next_var[self.scope];
        *next = (*next).max(index + 1);
        Ok(())
    }

    /// Introduce the next free register of the current scope
    pub fn introduce_next_var(
        &mut self,
        composition: Option<Composition>,
        name: impl Into<Arc<str>>,
        style: VarStyle,
        value: Option<Value>,
    ) -> VmResult<usize> {
        let index = self.next_var[self.scope];
        self.introduce_var(index, composition, name, style, value)?;
        Ok(index)
    }

    /// Metadata of a register, synthesized for argument registers
    ///
    /// Asking for a register that is neither introduced nor an argument is a
    /// protocol violation.
    pub fn get_var_info(&mut self, index: usize) -> VmResult<&VarInfo> {
        self.check_index(index)?;
        if self.infos[index].is_none() {
            if index >= self.arg_end {
                return Err(VmError::InvalidState(format!(
                    "register {} has no variable info",
                    index
                )));
            }
            let name = match (&self.target, index) {
                (Some(_), 0) => "<this>".to_string(),
                (Some(_), i) => format!("<arg {}>", i - 1),
                (None, i) => format!("<arg {}>", i),
            };
            let composition = self.registers[index]
                .as_ref()
                .map(|v| v.composition(self.context.types()));
            self.infos[index] = Some(VarInfo::new(composition, name, VarStyle::Standard));
        }
        self.infos[index]
            .as_ref()
            .ok_or_else(|| VmError::InvalidState(format!("register {} has no variable info", index)))
    }

    fn info_mut(&mut self, index: usize) -> &mut VarInfo {
        let info = &mut self.infos[index];
        info.get_or_insert_with(|| {
            VarInfo::new(None, format!("<reg {}>", index), VarStyle::Standard)
        })
    }

    /// Capture a register as a first-class reference
    ///
    /// A dynamic-reference register yields its own reference; otherwise a
    /// live reference is attached to the register and mirrors its writes
    /// until the register's scope is torn down.
    pub fn capture_ref(&mut self, index: usize) -> VmResult<RefHandle> {
        self.check_index(index)?;
        if let Some(info) = &self.infos[index] {
            if info.resume_style == VarStyle::DynamicRef {
                return match &self.registers[index] {
                    Some(Value::Ref(r)) => Ok(r.clone()),
                    _ => Err(VmError::InvalidState(format!(
                        "dynamic register {} holds no reference",
                        index
                    ))),
                };
            }
            if let Some(r) = &info.live_ref {
                return Ok(r.clone());
            }
        }
        let value = self.registers[index].clone();
        let info = self.info_mut(index);
        let r = RefHandle::var(info.name.clone(), value);
        info.live_ref = Some(r.clone());
        Ok(r)
    }

    // ===== reads =====

    /// Read an argument
    ///
    /// `Pending` means a deferred value is not ready yet; the register is
    /// left waiting and the op should be repeated once it resolves.
    /// Unassigned registers raise an exception.
    pub fn get_argument(&mut self, arg: Arg) -> Result<Poll<Value>, Fault> {
        match arg {
            Arg::Register(index) => self.get_register(index),
            Arg::Const(id) => Ok(Poll::Ready(self.context.constant(id)?)),
            Arg::Predefined(p) => self.get_predefined(p).map(Poll::Ready),
        }
    }

    /// Read several arguments; pending if any one of them is
    pub fn get_arguments(&mut self, args: &[Arg]) -> Result<Poll<Vec<Value>>, Fault> {
        let mut values = Vec::with_capacity(args.len());
        for &arg in args {
            match self.get_argument(arg)? {
                Poll::Ready(v) => values.push(v),
                Poll::Pending => return Ok(Poll::Pending),
            }
        }
        Ok(Poll::Ready(values))
    }

    /// Read a non-negative integer index
    pub fn get_index(&mut self, arg: Arg) -> Result<Poll<usize>, Fault> {
        let value = match self.get_argument(arg)? {
            Poll::Ready(v) => v,
            Poll::Pending => return Ok(Poll::Pending),
        };
        match value {
            Value::Int(i) => usize::try_from(i).map(Poll::Ready).map_err(|_| {
                Fault::Exception(
                    self.new_exception(ExceptionKind::OutOfBounds, format!("Negative index: {}", i)),
                )
            }),
            other => Err(Fault::Exception(self.new_exception(
                ExceptionKind::IllegalState,
                format!("Expected an Int index, got {:?}", other),
            ))),
        }
    }

    fn get_register(&mut self, index: usize) -> Result<Poll<Value>, Fault> {
        self.check_index(index)?;
        let style = self.infos[index].as_ref().map(VarInfo::style);
        match style {
            Some(VarStyle::Waiting) => match self.resolve_waiting(index)? {
                Poll::Pending => return Ok(Poll::Pending),
                Poll::Ready(Err(e)) => return Err(Fault::Exception(e)),
                Poll::Ready(Ok(())) => {
                    if self.infos[index].as_ref().map(VarInfo::style) == Some(VarStyle::DynamicRef) {
                        return self.read_dynamic_ref(index);
                    }
                }
            },
            Some(VarStyle::DynamicRef) => return self.read_dynamic_ref(index),
            _ => {}
        }

        if let Some(r) = self.infos[index].as_ref().and_then(|i| i.live_ref.clone()) {
            if let Ok(Poll::Ready(v)) = r.get(self.context.types()) {
                return Ok(Poll::Ready(v));
            }
        }

        match &self.registers[index] {
            Some(v) => Ok(Poll::Ready(v.clone())),
            None => {
                let name = self.infos[index]
                    .as_ref()
                    .map_or_else(|| format!("#{}", index), |i| i.name.to_string());
                Err(Fault::Exception(self.new_exception(
                    ExceptionKind::Unassigned,
                    format!("Unassigned value: {}", name),
                )))
            }
        }
    }

    fn get_predefined(&self, p: Predefined) -> Result<Value, Fault> {
        let target = || self.target.as_ref().ok_or(VmError::NoTarget(p.describe()));
        let value = match p {
            Predefined::Local => match &self.frame_local {
                Some(v) => v.clone(),
                None => {
                    return Err(Fault::Exception(
                        self.new_exception(ExceptionKind::Unassigned, "Unassigned value: <local>"),
                    ))
                }
            },
            Predefined::Target => target()?.clone(),
            Predefined::Public => target()?.with_access(Access::Public),
            Predefined::Protected => target()?.with_access(Access::Protected),
            Predefined::Private => target()?.with_access(Access::Private),
            Predefined::Struct => target()?.with_access(Access::Struct),
            Predefined::Super => {
                let chain = self
                    .chain
                    .as_ref()
                    .and_then(CallChain::super_chain)
                    .ok_or_else(|| VmError::InvalidCall("no super method".into()))?;
                let function = FunctionHandle::from_chain(chain);
                match &self.target {
                    Some(t) => Value::Function(function.bind_target(t.clone())),
                    None => Value::Function(function),
                }
            }
            Predefined::Service => self.context.service_handle(),
        };
        Ok(value)
    }

    fn read_dynamic_ref(&mut self, index: usize) -> Result<Poll<Value>, Fault> {
        let r = self.dynamic_ref(index)?;
        match r.get(self.context.types()) {
            Ok(Poll::Ready(v)) => Ok(Poll::Ready(v)),
            Ok(Poll::Pending) => {
                self.info_mut(index).wait();
                Ok(Poll::Pending)
            }
            Err(e) => Err(Fault::Exception(e)),
        }
    }

    fn dynamic_ref(&self, index: usize) -> VmResult<RefHandle> {
        match &self.registers[index] {
            Some(Value::Ref(r)) => Ok(r.clone()),
            _ => Err(VmError::InvalidState(format!(
                "dynamic register {} holds no reference",
                index
            ))),
        }
    }

    /// Re-check a waiting register; on completion it flips back to the
    /// style it had before waiting
    fn resolve_waiting(&mut self, index: usize) -> VmResult<Poll<Result<(), ExceptionHandle>>> {
        let resume_style = self.info_mut(index).resume_style;
        let outcome = if resume_style == VarStyle::DynamicRef {
            let r = self.dynamic_ref(index)?;
            match r.get(self.context.types()) {
                Ok(Poll::Pending) => return Ok(Poll::Pending),
                Ok(Poll::Ready(_)) => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            let future = match &self.registers[index] {
                Some(Value::Future(f)) => f.clone(),
                _ => {
                    return Err(VmError::InvalidState(format!(
                        "waiting register {} holds no future",
                        index
                    )))
                }
            };
            match future.poll() {
                None => return Ok(Poll::Pending),
                Some(Ok(v)) => {
                    self.registers[index] = Some(v.clone());
                    match self.infos[index].as_ref().and_then(|i| i.live_ref.clone()) {
                        Some(r) => r.set(self.context.types(), v),
                        None => Ok(()),
                    }
                }
                Some(Err(e)) => {
                    self.registers[index] = None;
                    Err(e)
                }
            }
        };
        self.info_mut(index).stop_waiting();
        Ok(Poll::Ready(outcome))
    }

    // ===== writes =====

    /// Write a value to a target, honoring the register's style
    ///
    /// Returns `Next`, `Exception` (pending exception set) or `Block` (the
    /// register now waits on a deferred value).
    pub fn assign_value(&mut self, target: Target, value: Value) -> VmResult<ControlSignal> {
        match target {
            Target::Unused => Ok(ControlSignal::Next),
            Target::Multi => Err(VmError::IllegalTarget(
                "multi-return target must be expanded by the caller".into(),
            )),
            Target::Local => match value {
                Value::Future(f) if f.is_deferred() => self.await_future(f, Target::Local),
                value => {
                    self.frame_local = Some(value);
                    Ok(ControlSignal::Next)
                }
            },
            Target::Register(index) => {
                self.check_index(index)?;
                match self.infos[index].as_ref().map(|i| (i.style, i.resume_style)) {
                    Some((VarStyle::DynamicRef, _)) | Some((VarStyle::Waiting, VarStyle::DynamicRef)) => {
                        let r = self.dynamic_ref(index)?;
                        self.info_mut(index).stop_waiting();
                        return match r.set(self.context.types(), value) {
                            Ok(()) => Ok(ControlSignal::Next),
                            Err(e) => Ok(self.raise_exception(e)),
                        };
                    }
                    Some((VarStyle::Waiting, _)) => self.info_mut(index).stop_waiting(),
                    _ => {}
                }
                match value {
                    Value::Future(f) if f.is_deferred() => self.await_future(f, target),
                    value => self.store(index, value),
                }
            }
        }
    }

    fn store(&mut self, index: usize, value: Value) -> VmResult<ControlSignal> {
        if let Some(r) = self.infos[index].as_ref().and_then(|i| i.live_ref.clone()) {
            if let Err(e) = r.set(self.context.types(), value.clone()) {
                return Ok(self.raise_exception(e));
            }
        }
        self.registers[index] = Some(value);
        Ok(ControlSignal::Next)
    }

    /// Assign the outcome of `future` to `target`, waiting if needed
    ///
    /// A completed future is unwrapped immediately (its failure raised);
    /// a pending one leaves the target waiting and returns `Block`.
    pub fn await_future(&mut self, future: FutureHandle, target: Target) -> VmResult<ControlSignal> {
        match future.poll() {
            Some(Ok(value)) => self.assign_value(target, value),
            Some(Err(e)) => Ok(self.raise_exception(e)),
            None => match target {
                Target::Multi => Err(VmError::IllegalTarget(
                    "cannot wait into a multi-return target".into(),
                )),
                Target::Register(index)
                    if self
                        .infos
                        .get(index)
                        .map_or(true, |i| i.as_ref().map_or(true, |i| i.resume_style == VarStyle::Standard)) =>
                {
                    self.check_index(index)?;
                    self.registers[index] = Some(Value::Future(future));
                    self.info_mut(index).wait();
                    Ok(ControlSignal::Block)
                }
                target => {
                    self.waiting.push((future, target));
                    Ok(ControlSignal::Block)
                }
            },
        }
    }

    /// Assign into a caller-style return target
    pub fn assign_to(&mut self, target: &ReturnTarget, value: Value) -> VmResult<ControlSignal> {
        match target {
            ReturnTarget::Single(t) => self.assign_value(*t, value),
            ReturnTarget::Multi(targets) => match targets.first() {
                Some(t) => self.assign_value(*t, value),
                None => Ok(ControlSignal::Next),
            },
        }
    }

    fn assign_multi(&mut self, targets: &[Target], values: Vec<Value>) -> VmResult<ControlSignal> {
        if values.len() < targets.len() {
            return Err(VmError::IllegalTarget(format!(
                "{} values returned into {} targets",
                values.len(),
                targets.len()
            )));
        }
        let mut blocked = false;
        for (target, value) in targets.iter().zip(values) {
            match self.assign_value(*target, value)? {
                ControlSignal::Exception => return Ok(ControlSignal::Exception),
                ControlSignal::Block => blocked = true,
                _ => {}
            }
        }
        Ok(if blocked {
            ControlSignal::Block
        } else {
            ControlSignal::Next
        })
    }

    /// Assign outside of any op; failures are logged instead of raised
    pub fn force_value(&mut self, target: Target, value: Value) {
        match self.assign_value(target, value) {
            Ok(ControlSignal::Exception) => {
                if let Some(e) = self.exception.take() {
                    tracing::warn!(exception = %e, ?target, "out-of-context assignment failed");
                }
            }
            Ok(ControlSignal::Block) => {
                tracing::warn!(?target, "out-of-context assignment left a pending value");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, ?target, "out-of-context assignment rejected"),
        }
    }

    // ===== waiting =====

    /// Re-check every waiting target after the fiber resumes
    ///
    /// Completed ones are resolved (a failure is raised, the last one
    /// winning); if any is still pending the frame stays blocked.
    pub fn check_waiting_registers(&mut self) -> VmResult<ControlSignal> {
        let mut failure = None;
        let mut blocked = false;

        for index in 0..self.infos.len() {
            if !self.infos[index].as_ref().map_or(false, VarInfo::is_waiting) {
                continue;
            }
            match self.resolve_waiting(index)? {
                Poll::Pending => blocked = true,
                Poll::Ready(Err(e)) => failure = Some(e),
                Poll::Ready(Ok(())) => {}
            }
        }

        for (future, target) in std::mem::take(&mut self.waiting) {
            match future.poll() {
                None => {
                    self.waiting.push((future, target));
                    blocked = true;
                }
                Some(Err(e)) => failure = Some(e),
                Some(Ok(value)) => match self.assign_value(target, value)? {
                    ControlSignal::Exception => failure = self.exception.take(),
                    ControlSignal::Block => blocked = true,
                    _ => {}
                },
            }
        }

        if let Some(e) = failure {
            return Ok(self.raise_exception(e));
        }
        Ok(if blocked {
            ControlSignal::Block
        } else {
            ControlSignal::Next
        })
    }

    /// Futures the frame is currently waiting on
    pub fn pending_futures(&self) -> Vec<FutureHandle> {
        let mut futures = Vec::new();
        for (index, info) in self.infos.iter().enumerate() {
            let Some(info) = info.as_ref().filter(|i| i.is_waiting()) else {
                continue;
            };
            let future = match (&self.registers[index], info.resume_style) {
                (Some(Value::Ref(r)), VarStyle::DynamicRef) => r.future(),
                (Some(Value::Future(f)), _) => Some(f.clone()),
                _ => None,
            };
            futures.extend(future.filter(|f| !f.is_done()));
        }
        futures.extend(
            self.waiting
                .iter()
                .filter(|(f, _)| !f.is_done())
                .map(|(f, _)| f.clone()),
        );
        futures
    }

    /// Whether anything in the frame waits on a future
    pub fn is_waiting(&self) -> bool {
        !self.waiting.is_empty() || self.infos.iter().flatten().any(VarInfo::is_waiting)
    }

    // ===== scopes =====

    /// Enter a nested scope
    pub fn enter_scope(&mut self) -> VmResult<()> {
        let next = self.scope + 1;
        if next >= self.next_var.len() {
            return Err(VmError::InvalidScope(format!(
                "scope {} exceeds declared depth {}",
                next,
                self.next_var.len()
            )));
        }
        self.next_var[next] = self.next_var[self.scope];
        self.scope = next;
        Ok(())
    }

    /// Leave the current scope, releasing its registers
    pub fn exit_scope(&mut self) -> VmResult<()> {
        if self.scope == 0 {
            return Err(VmError::InvalidScope("exit from the method scope".into()));
        }
        self.clear_scope(self.scope)?;
        self.scope -= 1;
        Ok(())
    }

    /// Release the registers introduced in scope `scope`
    pub fn clear_scope(&mut self, scope: usize) -> VmResult<()> {
        if scope == 0 || scope > self.scope {
            return Err(VmError::InvalidScope(format!(
                "cannot clear scope {} at depth {}",
                scope, self.scope
            )));
        }
        let (from, to) = (self.next_var[scope - 1], self.next_var[scope]);
        self.release_range(from, to);
        Ok(())
    }

    /// Release every register introduced in scopes above `scope`
    pub fn clear_all_scopes(&mut self, scope: usize) -> VmResult<()> {
        if scope > self.scope {
            return Err(VmError::InvalidScope(format!(
                "cannot clear above scope {} at depth {}",
                scope, self.scope
            )));
        }
        let (from, to) = (self.next_var[scope], self.next_var[self.scope]);
        self.release_range(from, to);
        Ok(())
    }

    fn release_range(&mut self, from: usize, to: usize) {
        let to = to.min(self.registers.len());
        for index in from..to {
            self.registers[index] = None;
            if let Some(info) = self.infos[index].take() {
                info.release();
            }
        }
        self.waiting
            .retain(|(_, t)| !matches!(t, Target::Register(i) if (from..to).contains(i)));
    }

    /// Release everything the frame holds
    pub fn release_all(&mut self) {
        self.release_range(0, self.registers.len());
        self.waiting.clear();
    }

    /// Enter a guarded region starting at `pc`
    ///
    /// A guard always opens its own scope; the guard records it so unwinding
    /// can restore it.
    pub fn enter_guard(&mut self, pc: usize, catches: Arc<[Catch]>) -> VmResult<()> {
        self.enter_scope()?;
        self.guards.push(Guard::new(pc, self.scope, catches));
        Ok(())
    }

    /// Leave the innermost guarded region normally
    pub fn exit_guard(&mut self) -> VmResult<()> {
        let guard = self
            .guards
            .pop()
            .ok_or_else(|| VmError::InvalidGuard("no active guard".into()))?;
        if guard.scope() != self.scope {
            return Err(VmError::InvalidGuard(format!(
                "guard opened scope {} but frame is at scope {}",
                guard.scope(),
                self.scope
            )));
        }
        self.exit_scope()
    }

    // ===== exceptions =====

    /// Route a fault: exceptions become pending, fatal errors propagate
    pub fn raise(&mut self, fault: Fault) -> VmResult<ControlSignal> {
        match fault {
            Fault::Exception(e) => Ok(self.raise_exception(e)),
            Fault::Fatal(err) => Err(err),
        }
    }

    /// Make `exception` pending
    pub fn raise_exception(&mut self, exception: ExceptionHandle) -> ControlSignal {
        self.exception = Some(exception);
        ControlSignal::Exception
    }

    /// Raise a new standard exception
    pub fn raise_error(&mut self, kind: ExceptionKind, message: impl Into<String>) -> ControlSignal {
        let e = self.new_exception(kind, message);
        self.raise_exception(e)
    }

    // ===== returns =====

    fn stage(&mut self, returned: Returned) -> VmResult<()> {
        if self.returned.is_some() {
            return Err(VmError::AlreadyReturned);
        }
        self.returned = Some(returned);
        Ok(())
    }

    /// Complete with a single value
    pub fn return_value(&mut self, value: Value) -> VmResult<ControlSignal> {
        self.stage(Returned::Value(value))?;
        Ok(ControlSignal::Return)
    }

    /// Complete with several values packed into a tuple
    pub fn return_tuple(&mut self, values: Vec<Value>) -> VmResult<ControlSignal> {
        self.stage(Returned::Tuple(values))?;
        Ok(ControlSignal::Return)
    }

    /// Complete with one value per caller target
    pub fn return_multi(&mut self, values: Vec<Value>) -> VmResult<ControlSignal> {
        self.stage(Returned::Multi(values))?;
        Ok(ControlSignal::Return)
    }

    /// Complete by delivering an exception to the caller
    pub fn return_exception(&mut self, exception: ExceptionHandle) -> VmResult<ControlSignal> {
        self.stage(Returned::Exception(exception))?;
        Ok(ControlSignal::ReturnException)
    }

    /// Whether a result has been staged
    pub fn has_returned(&self) -> bool {
        self.returned.is_some()
    }

    pub(crate) fn take_returned(&mut self) -> Option<Returned> {
        self.returned.take()
    }

    /// Deliver a callee's result into this (calling) frame
    ///
    /// Maps the assignment outcome to `Return`, `ReturnException` or
    /// `BlockReturn`.
    pub fn accept_return(
        &mut self,
        returned: Option<Returned>,
        target: &ReturnTarget,
    ) -> VmResult<ControlSignal> {
        let signal = match (returned, target) {
            (None, _) => ControlSignal::Next,
            (Some(Returned::Exception(e)), _) => self.raise_exception(e),
            (Some(Returned::Value(v)), target) => self.assign_to(target, v)?,
            (Some(Returned::Tuple(vs)), ReturnTarget::Single(t)) => {
                self.assign_value(*t, Value::tuple(vs))?
            }
            (Some(Returned::Tuple(vs)), ReturnTarget::Multi(ts))
            | (Some(Returned::Multi(vs)), ReturnTarget::Multi(ts)) => self.assign_multi(ts, vs)?,
            (Some(Returned::Multi(vs)), ReturnTarget::Single(Target::Local)) => {
                self.assign_value(Target::Local, Value::tuple(vs))?
            }
            (Some(Returned::Multi(vs)), ReturnTarget::Single(t)) => match vs.into_iter().next() {
                Some(v) => self.assign_value(*t, v)?,
                None => ControlSignal::Next,
            },
        };
        Ok(match signal {
            ControlSignal::Exception => ControlSignal::ReturnException,
            ControlSignal::Block => ControlSignal::BlockReturn,
            _ => ControlSignal::Return,
        })
    }

    // ===== calls =====

    /// Attach the callee to switch to
    pub fn set_next_frame(&mut self, frame: Frame) {
        self.next_frame = Some(Box::new(frame));
    }

    /// The callee prepared by the last call, if any
    pub fn next_frame(&self) -> Option<&Frame> {
        self.next_frame.as_deref()
    }

    /// Mutable access to the prepared callee
    pub fn next_frame_mut(&mut self) -> Option<&mut Frame> {
        self.next_frame.as_deref_mut()
    }

    pub(crate) fn take_next_frame(&mut self) -> Option<Frame> {
        self.next_frame.take().map(|f| *f)
    }

    /// Run `f` on this frame once the pending callee returns normally
    ///
    /// Continuations compose: a second one runs after the first has
    /// finished (including any call the first one makes).
    pub fn add_continuation(
        &mut self,
        f: impl FnOnce(&mut Frame) -> VmResult<ControlSignal> + Send + 'static,
    ) {
        let next: Continuation = Box::new(f);
        let combined: Continuation = match self.continuation.take() {
            None => next,
            Some(prev) => Box::new(move |frame: &mut Frame| match prev(frame)? {
                ControlSignal::Next => next(frame),
                ControlSignal::Call => {
                    frame.add_continuation(next);
                    Ok(ControlSignal::Call)
                }
                other => Ok(other),
            }),
        };
        self.continuation = Some(combined);
    }

    /// Whether a continuation is pending
    pub fn has_continuation(&self) -> bool {
        self.continuation.is_some()
    }

    pub(crate) fn take_continuation(&mut self) -> Option<Continuation> {
        self.continuation.take()
    }

    /// Finalizers collected by the construction this frame takes part in
    pub fn finalizers(&self) -> Option<&FinalizerChain> {
        self.finalizers.as_ref()
    }

    /// Join a construction's finalizer chain
    pub fn set_finalizers(&mut self, chain: FinalizerChain) {
        self.finalizers = Some(chain);
    }

    /// Swap the chain this frame collects finalizers into
    pub fn replace_finalizers(&mut self, chain: Option<FinalizerChain>) -> Option<FinalizerChain> {
        std::mem::replace(&mut self.finalizers, chain)
    }

    /// Register a constructor's finalizer with the enclosing construction
    pub fn chain_finalizer(&mut self, finalizer: FullyBoundHandle) -> VmResult<()> {
        match &self.finalizers {
            Some(chain) => {
                chain.push(finalizer);
                Ok(())
            }
            None => Err(VmError::InvalidCall(
                "finalizer chained outside of a construction".into(),
            )),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.method().map_or("<native>", |m| m.name());
        match self.ops.get(self.pc) {
            Some(op) => write!(f, "{} (pc={}, op={})", name, self.pc, op.name()),
            None => write!(f, "{} (pc={})", name, self.pc),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("method", &self.method().map(|m| m.name().to_string()))
            .field("pc", &self.pc)
            .field("scope", &self.scope)
            .field("guards", &self.guards.len())
            .field("registers", &self.registers)
            .field("exception", &self.exception)
            .finish()
    }
}
