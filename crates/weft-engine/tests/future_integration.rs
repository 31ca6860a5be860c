//! Integration tests for deferred values woven into dispatch

use parking_lot::Mutex;
use std::sync::Arc;
use std::task::Poll;
use weft_engine::vm::interpreter::ops::{
    Call, CatchEnd, GuardEnd, GuardStart, Invoke, Move, MoveRef, Return, ReturnTuple, VarDynamic,
    VarN, Wait,
};
use weft_engine::vm::{
    Arg, CallChain, Catch, Code, Completion, ControlSignal, ExceptionHandle, ExceptionKind, Fiber,
    FiberState, Frame, FunctionHandle, FutureHandle, Method, Op, RefHandle, ReturnTarget,
    Scheduler, ServiceContext, Target, Value, VarStyle,
};

// ===== helpers =====

fn op(op: impl Op + 'static) -> Arc<dyn Op> {
    Arc::new(op)
}

fn function(name: &str, argc: usize, registers: usize, ops: Vec<Arc<dyn Op>>) -> FunctionHandle {
    FunctionHandle::new(Arc::new(Method::bytecode(name, argc, Code::new(ops, registers, 1))))
}

fn frame(context: &Arc<ServiceContext>, registers: usize) -> Frame {
    let method = Arc::new(Method::bytecode("probe", 0, Code::new(Vec::new(), registers, 2)));
    Frame::new(context.clone(), CallChain::single(method), None, vec![], ReturnTarget::unused())
        .unwrap()
}

fn result(fiber: &Fiber) -> Option<Value> {
    fiber.result().poll().and_then(|outcome| outcome.ok())
}

type Calls = Arc<Mutex<Vec<(Value, Value)>>>;

/// Native two-argument callback recording `(value, failure)` pairs
fn recorder() -> (FunctionHandle, Calls) {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let log = calls.clone();
    let f = Method::native("record", 2, move |frame, args| {
        log.lock().push((args.arg(0), args.arg(1)));
        frame.assign_to(&args.ret, Value::Null)
    });
    (FunctionHandle::new(Arc::new(f)), calls)
}

/// `main(future)` registers constant 0 as a completion callback and returns
/// the chained future
fn when_complete_main() -> FunctionHandle {
    function(
        "main",
        1,
        2,
        vec![
            op(Invoke {
                target: Arg::Register(0),
                method: "whenComplete".into(),
                args: vec![Arg::Const(0)],
                ret: ReturnTarget::register(1),
            }),
            op(Return { value: Arg::Register(1) }),
        ],
    )
}

// ===== combinators =====

#[test]
fn test_when_complete_schedules_callback_after_completion() {
    let (callback, calls) = recorder();
    let context = ServiceContext::builder("futures")
        .constants(vec![Value::Function(callback)])
        .build();
    let scheduler = Scheduler::new(context);
    let source = FutureHandle::new();

    let main = scheduler.spawn(when_complete_main(), vec![Value::Future(source.clone())]);
    scheduler.run_until_idle();
    let chained = result(&main).and_then(|v| v.as_future().cloned()).unwrap();
    assert!(!chained.is_done());
    assert!(calls.lock().is_empty());

    source.complete(Value::int(42)).unwrap();
    assert_eq!(scheduler.live_fibers(), 1);
    scheduler.run_until_idle();

    assert_eq!(*calls.lock(), vec![(Value::int(42), Value::Null)]);
    assert_eq!(chained.poll().and_then(|o| o.ok()), Some(Value::int(42)));
}

#[test]
fn test_when_complete_on_done_future_runs_inline() {
    let (callback, calls) = recorder();
    let context = ServiceContext::builder("futures")
        .constants(vec![Value::Function(callback)])
        .build();
    let scheduler = Scheduler::new(context);
    let source = FutureHandle::completed(Value::int(5));

    let main = scheduler.spawn(when_complete_main(), vec![Value::Future(source.clone())]);
    assert_eq!(scheduler.run_until_idle(), 1);

    assert_eq!(*calls.lock(), vec![(Value::int(5), Value::Null)]);
    let returned = result(&main).and_then(|v| v.as_future().cloned()).unwrap();
    assert!(returned.ptr_eq(&source));
}

#[test]
fn test_when_complete_reports_failure() {
    let (callback, calls) = recorder();
    let context = ServiceContext::builder("futures")
        .constants(vec![Value::Function(callback)])
        .build();
    let scheduler = Scheduler::new(context.clone());
    let source = FutureHandle::new();

    let main = scheduler.spawn(when_complete_main(), vec![Value::Future(source.clone())]);
    scheduler.run_until_idle();
    let chained = result(&main).and_then(|v| v.as_future().cloned()).unwrap();

    let e = context.types().exception(ExceptionKind::Exception, "nope");
    source.fail(e.clone()).unwrap();
    scheduler.run_until_idle();

    let calls = calls.lock();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].0.is_null());
    assert!(calls[0].1.as_exception().unwrap().ptr_eq(&e));
    assert!(chained.failure().unwrap().ptr_eq(&e));
}

// ===== waiting in bytecode =====

#[test]
fn test_wait_parks_until_future_completes() {
    let context = ServiceContext::builder("wait").build();
    let scheduler = Scheduler::new(context);
    let source = FutureHandle::new();
    let main = function(
        "main",
        1,
        2,
        vec![
            op(Wait { source: Arg::Register(0), to: Target::Register(1) }),
            op(Return { value: Arg::Register(1) }),
        ],
    );

    let fiber = scheduler.spawn(main, vec![Value::Future(source.clone())]);
    scheduler.run_until_idle();
    assert_eq!(fiber.state(), FiberState::Parked);

    source.complete(Value::string("ready")).unwrap();
    scheduler.run_until_idle();
    assert_eq!(result(&fiber), Some(Value::string("ready")));
}

#[test]
fn test_wait_on_failed_future_raises_when_observed() {
    let context = ServiceContext::builder("wait").build();
    let scheduler = Scheduler::new(context.clone());
    let source = FutureHandle::new();
    let main = function(
        "main",
        1,
        2,
        vec![
            op(Wait { source: Arg::Register(0), to: Target::Register(1) }),
            op(Return { value: Arg::Register(1) }),
        ],
    );

    let fiber = scheduler.spawn(main, vec![Value::Future(source.clone())]);
    scheduler.run_until_idle();
    let e = context.types().exception(ExceptionKind::Exception, "late failure");
    source.fail(e.clone()).unwrap();
    scheduler.run_until_idle();

    assert_eq!(fiber.state(), FiberState::Failed);
    assert!(fiber.result().failure().unwrap().ptr_eq(&e));
}

#[test]
fn test_deferred_value_assignment_parks_fiber() {
    let context = ServiceContext::builder("deferred").build();
    let scheduler = Scheduler::new(context);
    let source = FutureHandle::deferred();
    // r1 receives the deferred value and waits on it
    let main = function(
        "main",
        1,
        3,
        vec![
            op(Move { from: Arg::Register(0), to: Target::Register(1) }),
            op(Move { from: Arg::Register(1), to: Target::Register(2) }),
            op(Return { value: Arg::Register(2) }),
        ],
    );

    let fiber = scheduler.spawn(main, vec![Value::Future(source.clone())]);
    scheduler.run_until_idle();
    assert_eq!(fiber.state(), FiberState::Parked);

    source.complete(Value::int(9)).unwrap();
    scheduler.run_until_idle();
    assert_eq!(result(&fiber), Some(Value::int(9)));
}

/// A native call whose callee returns a deferred value leaves a continuation
/// on the caller. When the value fails and a guard catches it, the handler's
/// own calls must not run that continuation.
#[test]
fn test_caught_deferred_failure_drops_pending_continuation() {
    let source = FutureHandle::deferred();
    let pending = function("pending", 0, 1, vec![op(Return { value: Arg::Const(4) })]);
    let launch = Method::native("launch", 0, move |frame, _| {
        let signal = pending.call(frame, vec![], ReturnTarget::register(3))?;
        frame.add_continuation(|frame| frame.assign_value(Target::Register(0), Value::int(99)));
        Ok(signal)
    });
    let five = function("five", 0, 1, vec![op(Return { value: Arg::Const(3) })]);
    let context = ServiceContext::builder("deferred")
        .constants(vec![
            Value::Function(FunctionHandle::new(Arc::new(launch))),
            Value::Function(five),
            Value::int(0),
            Value::int(5),
            Value::Future(source.clone()),
        ])
        .build();
    let catches: Arc<[Catch]> =
        vec![Catch::new(context.types().builtins().exception.id(), "e", 4)].into();
    let ops = vec![
        op(VarN { index: 0, composition: None, name: "marker".into(), value: Arg::Const(2) }),
        op(GuardStart { catches }),
        op(Call { function: Arg::Const(0), args: vec![], ret: ReturnTarget::unused() }),
        op(GuardEnd { offset: 3 }),
        op(Call { function: Arg::Const(1), args: vec![], ret: ReturnTarget::register(2) }),
        op(CatchEnd { offset: 1 }),
        op(ReturnTuple { values: vec![Arg::Register(0), Arg::Register(2)] }),
    ];
    let main = FunctionHandle::new(Arc::new(Method::bytecode("main", 0, Code::new(ops, 4, 2))));

    let scheduler = Scheduler::new(context.clone());
    let fiber = scheduler.spawn(main, vec![]);
    scheduler.run_until_idle();
    assert_eq!(fiber.state(), FiberState::Parked);

    let e = context.types().exception(ExceptionKind::Exception, "never arrived");
    source.fail(e).unwrap();
    scheduler.run_until_idle();
    assert_eq!(fiber.state(), FiberState::Completed);
    assert_eq!(result(&fiber), Some(Value::tuple(vec![Value::int(0), Value::int(5)])));
}

#[test]
fn test_wait_on_forward_reference_set_elsewhere() {
    let context = ServiceContext::builder("refs").build();
    let scheduler = Scheduler::new(context.clone());
    let reference = RefHandle::future_var("answer");
    let main = function(
        "main",
        1,
        2,
        vec![
            op(Wait { source: Arg::Register(0), to: Target::Register(1) }),
            op(Return { value: Arg::Register(1) }),
        ],
    );

    let fiber = scheduler.spawn(main, vec![Value::Ref(reference.clone())]);
    scheduler.run_until_idle();
    assert_eq!(fiber.state(), FiberState::Parked);

    reference.set(context.types(), Value::int(42)).unwrap();
    scheduler.run_until_idle();
    assert_eq!(result(&fiber), Some(Value::int(42)));
}

#[test]
fn test_reference_natives_through_invoke() {
    let context = ServiceContext::builder("refs").constants(vec![Value::int(3)]).build();
    let scheduler = Scheduler::new(context);
    let main = function(
        "main",
        0,
        3,
        vec![
            op(VarDynamic { index: 0, composition: None, name: "x".into(), future: true }),
            op(MoveRef { register: 0, to: Target::Register(1) }),
            op(Invoke {
                target: Arg::Register(1),
                method: "set".into(),
                args: vec![Arg::Const(0)],
                ret: ReturnTarget::unused(),
            }),
            op(Invoke {
                target: Arg::Register(1),
                method: "completion".into(),
                args: vec![],
                ret: ReturnTarget::register(2),
            }),
            op(Return { value: Arg::Register(2) }),
        ],
    );

    let fiber = scheduler.spawn(main, vec![]);
    scheduler.run_until_idle();
    assert_eq!(result(&fiber), Some(Value::string("Result")));
}

// ===== references =====

#[test]
fn test_connected_reference_sees_failure() {
    let context = ServiceContext::builder("refs").build();
    let types = context.types();
    let a = RefHandle::future_var("a");
    let b = RefHandle::future_var("b");
    let a_future = a.ensure_future().unwrap();
    b.ensure_future().unwrap();

    b.set(types, Value::Future(a_future.clone())).unwrap();
    assert!(matches!(b.get(types), Ok(Poll::Pending)));

    let e = types.exception(ExceptionKind::Exception, "E");
    a_future.fail(e.clone()).unwrap();
    match b.get(types) {
        Err(failure) => assert!(failure.ptr_eq(&e)),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(b.future().unwrap().completion(), Completion::Error);
}

#[test]
fn test_double_set_keeps_first_value() {
    let context = ServiceContext::builder("refs").build();
    let mut f = frame(&context, 2);
    f.introduce_var(
        0,
        None,
        "x",
        VarStyle::DynamicRef,
        Some(Value::Ref(RefHandle::future_var("x"))),
    )
    .unwrap();

    assert_eq!(
        f.assign_value(Target::Register(0), Value::string("X")).unwrap(),
        ControlSignal::Next
    );
    assert_eq!(
        f.assign_value(Target::Register(0), Value::string("Y")).unwrap(),
        ControlSignal::Exception
    );
    let e: ExceptionHandle = f.take_exception().unwrap();
    assert!(e.message().contains("already been set"));
    assert_eq!(
        f.get_argument(Arg::Register(0)).unwrap(),
        Poll::Ready(Value::string("X"))
    );
}

#[test]
fn test_waiting_register_resolves_on_next_read() {
    let context = ServiceContext::builder("waiting").build();
    let mut f = frame(&context, 2);
    let future = FutureHandle::new();

    assert_eq!(
        f.await_future(future.clone(), Target::Register(0)).unwrap(),
        ControlSignal::Block
    );
    assert_eq!(f.var_info(0).unwrap().style(), VarStyle::Waiting);
    assert_eq!(f.get_argument(Arg::Register(0)).unwrap(), Poll::Pending);

    future.complete(Value::int(11)).unwrap();
    assert_eq!(
        f.get_argument(Arg::Register(0)).unwrap(),
        Poll::Ready(Value::int(11))
    );
    assert_eq!(f.var_info(0).unwrap().style(), VarStyle::Standard);
    assert!(!f.is_waiting());
}

#[test]
fn test_resolved_deferred_value_reads_immediately() {
    let context = ServiceContext::builder("deferred").build();
    let mut f = frame(&context, 1);
    let done = FutureHandle::completed(Value::int(4));

    assert_eq!(
        f.await_future(done, Target::Register(0)).unwrap(),
        ControlSignal::Next
    );
    assert_eq!(f.get_argument(Arg::Register(0)).unwrap(), Poll::Ready(Value::int(4)));
}

// ===== many fibers =====

#[test]
fn test_many_fibers_wake_on_one_future() {
    let context = ServiceContext::builder("fan-out").build();
    let scheduler = Scheduler::new(context);
    let gate = FutureHandle::new();
    let waiter = function(
        "waiter",
        1,
        2,
        vec![
            op(Wait { source: Arg::Register(0), to: Target::Register(1) }),
            op(Return { value: Arg::Register(1) }),
        ],
    );

    let fibers: Vec<_> = (0..32)
        .map(|_| scheduler.spawn(waiter.clone(), vec![Value::Future(gate.clone())]))
        .collect();
    scheduler.run_workers(4);
    assert!(fibers.iter().all(|f| f.state() == FiberState::Parked));

    gate.complete(Value::bool(true)).unwrap();
    scheduler.run_workers(4);
    assert!(fibers.iter().all(|f| result(f) == Some(Value::bool(true))));
    assert_eq!(scheduler.live_fibers(), 0);
}
