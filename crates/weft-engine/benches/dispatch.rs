use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use weft_engine::vm::interpreter::ops::{Arith, ArithOp, Call, Return, Throw};
use weft_engine::vm::interpreter::ops::{CatchEnd, GuardEnd, GuardStart, Move};
use weft_engine::vm::{
    Arg, Catch, Code, ExceptionKind, FunctionHandle, Method, Op, ReturnTarget, Scheduler,
    ServiceContext, Target, Value,
};

fn op(op: impl Op + 'static) -> Arc<dyn Op> {
    Arc::new(op)
}

fn function(name: &str, registers: usize, scopes: usize, ops: Vec<Arc<dyn Op>>) -> FunctionHandle {
    FunctionHandle::new(Arc::new(Method::bytecode(name, 0, Code::new(ops, registers, scopes))))
}

fn run(scheduler: &Scheduler, f: &FunctionHandle) -> Value {
    let fiber = scheduler.spawn(f.clone(), vec![]);
    scheduler.run_until_idle();
    fiber.result().poll().and_then(|o| o.ok()).unwrap_or_default()
}

fn bench_straight_line(c: &mut Criterion) {
    let context = ServiceContext::builder("bench").constants(vec![Value::int(1)]).build();
    let mut ops = vec![op(Move { from: Arg::Const(0), to: Target::Register(0) })];
    for _ in 0..256 {
        ops.push(op(Arith {
            op: ArithOp::Add,
            lhs: Arg::Register(0),
            rhs: Arg::Const(0),
            to: Target::Register(0),
        }));
    }
    ops.push(op(Return { value: Arg::Register(0) }));
    let f = function("sum", 1, 1, ops);
    let scheduler = Scheduler::new(context);

    c.bench_function("arith_256", |b| b.iter(|| run(&scheduler, black_box(&f))));
}

fn bench_call_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("call_depth");

    for depth in [8usize, 64, 256] {
        // Level i calls constant i + 1; the last level returns a constant
        let mut constants = vec![Value::Null; depth + 2];
        constants[depth + 1] = Value::int(1);
        let mut levels = Vec::with_capacity(depth + 1);
        for level in 0..=depth {
            let ops = if level == depth {
                vec![op(Return { value: Arg::Const(depth as u32 + 1) })]
            } else {
                vec![
                    op(Call {
                        function: Arg::Const(level as u32 + 1),
                        args: vec![],
                        ret: ReturnTarget::register(0),
                    }),
                    op(Return { value: Arg::Register(0) }),
                ]
            };
            levels.push(function("level", 1, 1, ops));
        }
        for (level, f) in levels.iter().enumerate() {
            constants[level] = Value::Function(f.clone());
        }
        let context = ServiceContext::builder("bench").constants(constants).build();
        let scheduler = Scheduler::new(context);

        group.bench_with_input(BenchmarkId::from_parameter(depth), &levels[0], |b, f| {
            b.iter(|| run(&scheduler, f))
        });
    }

    group.finish();
}

fn bench_unwind(c: &mut Criterion) {
    let context = ServiceContext::builder("bench").build();
    let thrown = context.types().exception(ExceptionKind::IllegalState, "bench");
    let thrower = function("thrower", 0, 1, vec![op(Throw { exception: Arg::Const(1) })]);
    let catches: Arc<[Catch]> = vec![Catch::new(
        context.types().builtins().exception.id(),
        "e",
        3,
    )]
    .into();
    let caller = function(
        "caller",
        2,
        2,
        vec![
            op(GuardStart { catches }),
            op(Call { function: Arg::Const(0), args: vec![], ret: ReturnTarget::register(1) }),
            op(GuardEnd { offset: 3 }),
            op(Move { from: Arg::Register(0), to: Target::Register(1) }),
            op(CatchEnd { offset: 1 }),
            op(Return { value: Arg::Register(1) }),
        ],
    );
    let context = ServiceContext::builder("bench")
        .types(context.types().clone())
        .constants(vec![Value::Function(thrower), Value::Exception(thrown)])
        .build();
    let scheduler = Scheduler::new(context);

    c.bench_function("catch_across_frames", |b| b.iter(|| run(&scheduler, black_box(&caller))));
}

criterion_group!(benches, bench_straight_line, bench_call_depth, bench_unwind);
criterion_main!(benches);
