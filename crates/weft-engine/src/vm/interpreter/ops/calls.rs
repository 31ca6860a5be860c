//! Call, dispatch and construction ops

use super::Op;
use crate::vm::interpreter::{
    Arg, CallChain, ControlSignal, FinalizerChain, Frame, FullyBoundHandle, FunctionHandle,
    ReturnTarget, Target,
};
use crate::vm::object::{Access, ObjectHandle};
use crate::vm::types::{CompositionId, ExceptionKind};
use crate::vm::value::Value;
use crate::vm::{VmError, VmResult};
use std::sync::Arc;

/// Name constructors are registered under
pub const CONSTRUCTOR: &str = "construct";

fn callable(frame: &mut Frame, value: Value) -> Result<FunctionHandle, ControlSignal> {
    match value {
        Value::Function(f) => Ok(f),
        other => Err(frame.raise_error(
            ExceptionKind::IllegalState,
            format!("{:?} is not callable", other),
        )),
    }
}

/// Call a function value
#[derive(Debug, Clone)]
pub struct Call {
    /// Function
    pub function: Arg,
    /// Arguments
    pub args: Vec<Arg>,
    /// Result destination
    pub ret: ReturnTarget,
}

impl Op for Call {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let function = ready!(frame, frame.get_argument(self.function));
        let args = ready!(frame, frame.get_arguments(&self.args));
        match callable(frame, function) {
            Ok(f) => f.call(frame, args, self.ret.clone()),
            Err(signal) => Ok(signal),
        }
    }

    fn name(&self) -> &'static str {
        "CALL"
    }
}

/// Invoke a method by name on a target, dispatching on its composition
#[derive(Debug, Clone)]
pub struct Invoke {
    /// Target
    pub target: Arg,
    /// Method name
    pub method: Arc<str>,
    /// Arguments
    pub args: Vec<Arg>,
    /// Result destination
    pub ret: ReturnTarget,
}

impl Op for Invoke {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let target = ready!(frame, frame.get_argument(self.target));
        let args = ready!(frame, frame.get_arguments(&self.args));
        let composition = target.composition(frame.context().types());
        let Some(chain) = frame.context().templates().resolve_chain(&composition, &self.method) else {
            return Ok(frame.raise_error(
                ExceptionKind::IllegalState,
                format!("No method \"{}\" on {}", self.method, composition),
            ));
        };
        FunctionHandle::from_chain(chain)
            .bind_target(target)
            .call(frame, args, self.ret.clone())
    }

    fn name(&self) -> &'static str {
        "INVOKE"
    }
}

/// Call the super implementation of the running method
#[derive(Debug, Clone)]
pub struct CallSuper {
    /// Arguments
    pub args: Vec<Arg>,
    /// Result destination
    pub ret: ReturnTarget,
}

impl Op for CallSuper {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let args = ready!(frame, frame.get_arguments(&self.args));
        let chain = frame
            .chain()
            .and_then(CallChain::super_chain)
            .ok_or_else(|| VmError::InvalidCall("no super method".into()))?;
        let mut function = FunctionHandle::from_chain(chain);
        if let Some(target) = frame.target() {
            function = function.bind_target(target.clone());
        }
        function.call(frame, args, self.ret.clone())
    }

    fn name(&self) -> &'static str {
        "CALL_SUPER"
    }
}

/// Bind a method to a target, producing a function value
#[derive(Debug, Clone)]
pub struct BindMethod {
    /// Target
    pub target: Arg,
    /// Method name
    pub method: Arc<str>,
    /// Destination
    pub to: Target,
}

impl Op for BindMethod {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let target = ready!(frame, frame.get_argument(self.target));
        let composition = target.composition(frame.context().types());
        match frame.context().templates().resolve_chain(&composition, &self.method) {
            Some(chain) => {
                let function = FunctionHandle::from_chain(chain).bind_target(target);
                frame.assign_value(self.to, Value::Function(function))
            }
            None => Ok(frame.raise_error(
                ExceptionKind::IllegalState,
                format!("No method \"{}\" on {}", self.method, composition),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "MBIND"
    }
}

/// Bind one parameter of a function (currying)
#[derive(Debug, Clone, Copy)]
pub struct BindArg {
    /// Function
    pub function: Arg,
    /// Index among the remaining parameters
    pub index: usize,
    /// Bound value
    pub value: Arg,
    /// Destination
    pub to: Target,
}

impl Op for BindArg {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let function = ready!(frame, frame.get_argument(self.function));
        let value = ready!(frame, frame.get_argument(self.value));
        match callable(frame, function) {
            Ok(f) => {
                let bound = f.bind(self.index, value)?;
                frame.assign_value(self.to, Value::Function(bound))
            }
            Err(signal) => Ok(signal),
        }
    }

    fn name(&self) -> &'static str {
        "FBIND"
    }
}

/// Run collected finalizers (base first), then deliver the new object
fn finish_construction(
    frame: &mut Frame,
    mut pending: Vec<FullyBoundHandle>,
    object: Value,
    to: Target,
) -> VmResult<ControlSignal> {
    while let Some(finalizer) = pending.pop() {
        match finalizer.call(frame)? {
            ControlSignal::Next => {}
            ControlSignal::Call => {
                frame.add_continuation(move |frame| finish_construction(frame, pending, object, to));
                return Ok(ControlSignal::Call);
            }
            other => return Ok(other),
        }
    }
    frame.assign_value(to, object.with_access(Access::Public))
}

/// Allocate and construct a new object
///
/// Constructors receive the struct view of the object. Once the whole
/// constructor chain has completed, the collected `finally` blocks run and
/// the public view is assigned to `to`.
#[derive(Debug, Clone)]
pub struct New {
    /// Composition to instantiate
    pub composition: CompositionId,
    /// Constructor arguments
    pub args: Vec<Arg>,
    /// Destination
    pub to: Target,
}

impl Op for New {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let args = ready!(frame, frame.get_arguments(&self.args));
        let composition = frame.context().types().resolve(self.composition)?;
        let object = Value::Object(ObjectHandle::new(composition.clone()));

        let Some(chain) = frame.context().templates().resolve_chain(&composition, CONSTRUCTOR) else {
            if !args.is_empty() {
                return Ok(frame.raise_error(
                    ExceptionKind::IllegalState,
                    format!("{} has no constructor", composition),
                ));
            }
            return frame.assign_value(self.to, object.with_access(Access::Public));
        };

        let finalizers = FinalizerChain::new();
        let constructor = FunctionHandle::from_chain(chain).bind_target(object.clone());
        let outer = frame.replace_finalizers(Some(finalizers.clone()));
        let signal = constructor.construct(frame, args);
        frame.replace_finalizers(outer);
        match signal? {
            ControlSignal::Call => {
                let to = self.to;
                frame.add_continuation(move |frame| {
                    finish_construction(frame, finalizers.take(), object, to)
                });
                Ok(ControlSignal::Call)
            }
            ControlSignal::Next => finish_construction(frame, finalizers.take(), object, self.to),
            other => Ok(other),
        }
    }

    fn name(&self) -> &'static str {
        "NEW"
    }
}

/// Call the super constructor from within a constructor
#[derive(Debug, Clone)]
pub struct Construct {
    /// Arguments
    pub args: Vec<Arg>,
}

impl Op for Construct {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let args = ready!(frame, frame.get_arguments(&self.args));
        if frame.finalizers().is_none() {
            return Err(VmError::InvalidCall("construct outside of a constructor".into()));
        }
        let chain = frame
            .chain()
            .and_then(CallChain::super_chain)
            .ok_or_else(|| VmError::InvalidCall("no super constructor".into()))?;
        let target = frame.target().cloned().ok_or(VmError::NoTarget("construct"))?;
        FunctionHandle::from_chain(chain)
            .bind_target(target)
            .construct(frame, args)
    }

    fn name(&self) -> &'static str {
        "CONSTRUCT"
    }
}
