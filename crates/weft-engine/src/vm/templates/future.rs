//! Native templates for futures and future references
//!
//! Chaining combinators take a fast path when the source is already done
//! (the callback runs on the calling fiber) and otherwise schedule the
//! callback on a new fiber once the source completes, returning a new
//! future for the chained result.

use crate::vm::future::{Completion, FutureHandle, Outcome};
use crate::vm::interpreter::{
    ControlSignal, Frame, FunctionHandle, Method, NativeArgs, ReturnTarget, Target,
};
use crate::vm::templates::TemplateRegistry;
use crate::vm::types::{ExceptionKind, TypeRegistry};
use crate::vm::value::Value;
use crate::vm::{VmError, VmResult};

type CallbackArgs = fn(&Outcome) -> Option<Vec<Value>>;

pub(super) fn install(registry: &TemplateRegistry, types: &TypeRegistry) {
    let builtins = types.builtins();
    for composition in [&builtins.future, &builtins.reference] {
        registry.register(composition, Method::native("whenComplete", 1, when_complete));
        registry.register(composition, Method::native("thenDo", 1, then_do));
        registry.register(composition, Method::native("passTo", 1, pass_to));
        registry.register(composition, Method::native("get", 0, get));
        registry.register(composition, Method::native("set", 1, set));
        registry.register(
            composition,
            Method::native("completeExceptionally", 1, complete_exceptionally),
        );
        registry.register(composition, Method::native("assigned", 0, assigned));
        registry.register(composition, Method::native("completion", 0, completion));
        registry.register(composition, Method::native("failure", 0, failure));
    }
}

fn source(args: &NativeArgs) -> VmResult<FutureHandle> {
    match &args.target {
        Some(Value::Future(f)) => Ok(f.clone()),
        Some(Value::Ref(r)) => r
            .ensure_future()
            .ok_or_else(|| VmError::InvalidCall(format!("{} is not a future reference", r.name()))),
        other => Err(VmError::InvalidCall(format!("{:?} is not a future", other))),
    }
}

fn single(ret: &ReturnTarget) -> Target {
    match ret {
        ReturnTarget::Single(t) => *t,
        ReturnTarget::Multi(ts) => ts.first().copied().unwrap_or(Target::Unused),
    }
}

fn callback(frame: &mut Frame, value: Value) -> Result<FunctionHandle, ControlSignal> {
    match value {
        Value::Function(f) => Ok(f),
        other => Err(frame.raise_error(
            ExceptionKind::IllegalState,
            format!("{:?} is not a function", other),
        )),
    }
}

/// Run `function` after `source` completes
///
/// `make_args` picks the callback arguments for an outcome, or `None` to
/// skip the callback and pass the outcome through.
fn chain(
    frame: &mut Frame,
    source: FutureHandle,
    function: FunctionHandle,
    make_args: CallbackArgs,
    ret: ReturnTarget,
) -> VmResult<ControlSignal> {
    if let Some(outcome) = source.poll() {
        let Some(args) = make_args(&outcome) else {
            return frame.assign_to(&ret, Value::Future(source));
        };
        return match function.call(frame, args, ReturnTarget::unused())? {
            ControlSignal::Next => frame.assign_to(&ret, Value::Future(source)),
            ControlSignal::Call => {
                frame.add_continuation(move |frame| frame.assign_to(&ret, Value::Future(source)));
                Ok(ControlSignal::Call)
            }
            other => Ok(other),
        };
    }

    let chained = FutureHandle::new();
    let result = chained.clone();
    let context = frame.context().clone();
    source.on_complete(move |outcome| {
        let outcome = outcome.clone();
        let Some(args) = make_args(&outcome) else {
            let _ = result.resolve(outcome);
            return;
        };
        let fiber = context.call_later(function, args);
        fiber.result().on_complete(move |done| {
            let chained_outcome = match done {
                Err(e) => Err(e.clone()),
                Ok(_) => outcome,
            };
            let _ = result.resolve(chained_outcome);
        });
    });
    frame.assign_to(&ret, Value::Future(chained))
}

fn when_complete(frame: &mut Frame, args: NativeArgs) -> VmResult<ControlSignal> {
    let source = source(&args)?;
    let function = match callback(frame, args.arg(0)) {
        Ok(f) => f,
        Err(signal) => return Ok(signal),
    };
    chain(
        frame,
        source,
        function,
        |outcome| {
            Some(match outcome {
                Ok(v) => vec![v.clone(), Value::Null],
                Err(e) => vec![Value::Null, Value::Exception(e.clone())],
            })
        },
        args.ret,
    )
}

fn then_do(frame: &mut Frame, args: NativeArgs) -> VmResult<ControlSignal> {
    let source = source(&args)?;
    let function = match callback(frame, args.arg(0)) {
        Ok(f) => f,
        Err(signal) => return Ok(signal),
    };
    chain(frame, source, function, |outcome| outcome.as_ref().ok().map(|_| Vec::new()), args.ret)
}

fn pass_to(frame: &mut Frame, args: NativeArgs) -> VmResult<ControlSignal> {
    let source = source(&args)?;
    let function = match callback(frame, args.arg(0)) {
        Ok(f) => f,
        Err(signal) => return Ok(signal),
    };
    chain(
        frame,
        source,
        function,
        |outcome| outcome.as_ref().ok().map(|v| vec![v.clone()]),
        args.ret,
    )
}

fn get(frame: &mut Frame, args: NativeArgs) -> VmResult<ControlSignal> {
    let source = source(&args)?;
    frame.await_future(source, single(&args.ret))
}

fn set(frame: &mut Frame, args: NativeArgs) -> VmResult<ControlSignal> {
    let value = args.arg(0);
    let result = match &args.target {
        Some(Value::Ref(r)) => r.set(frame.context().types(), value),
        _ => source(&args)?
            .complete(value)
            .map_err(|_| frame.new_exception(ExceptionKind::IllegalState, "Future has already been set")),
    };
    match result {
        Ok(()) => Ok(ControlSignal::Next),
        Err(e) => Ok(frame.raise_exception(e)),
    }
}

fn complete_exceptionally(frame: &mut Frame, args: NativeArgs) -> VmResult<ControlSignal> {
    let source = source(&args)?;
    let Value::Exception(e) = args.arg(0) else {
        return Ok(frame.raise_error(
            ExceptionKind::IllegalState,
            format!("{:?} is not an exception", args.arg(0)),
        ));
    };
    match source.fail(e) {
        Ok(()) => Ok(ControlSignal::Next),
        Err(_) => Ok(frame.raise_error(ExceptionKind::IllegalState, "Future has already been set")),
    }
}

fn assigned(frame: &mut Frame, args: NativeArgs) -> VmResult<ControlSignal> {
    let done = source(&args)?.is_done();
    frame.assign_to(&args.ret, Value::bool(done))
}

fn completion(frame: &mut Frame, args: NativeArgs) -> VmResult<ControlSignal> {
    let name = match source(&args)?.completion() {
        Completion::Pending => "Pending",
        Completion::Result => "Result",
        Completion::Error => "Error",
    };
    frame.assign_to(&args.ret, Value::string(name))
}

fn failure(frame: &mut Frame, args: NativeArgs) -> VmResult<ControlSignal> {
    let failure = source(&args)?
        .failure()
        .map_or(Value::Null, Value::Exception);
    frame.assign_to(&args.ret, failure)
}
