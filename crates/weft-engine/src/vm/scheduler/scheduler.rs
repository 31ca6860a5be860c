//! Scheduler driving fibers over worker threads

use super::fiber::{Fiber, FiberId, FiberStatus};
use crate::vm::interpreter::{FunctionHandle, ServiceContext};
use crate::vm::value::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Fibers created so far
    pub fibers_spawned: u64,
    /// Fibers that have terminated
    pub fibers_completed: u64,
    /// Fibers not yet terminated
    pub live_fibers: usize,
}

/// Runs the fibers of one service
///
/// Fibers are pulled from the service's run queue. Parked fibers are not in
/// the queue; their futures push them back when they complete.
pub struct Scheduler {
    context: Arc<ServiceContext>,
}

impl Scheduler {
    /// Create a scheduler for `context`
    pub fn new(context: Arc<ServiceContext>) -> Self {
        Self { context }
    }

    /// Service being scheduled
    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.context
    }

    /// Spawn a fiber calling `function` with `args`
    pub fn spawn(&self, function: FunctionHandle, args: Vec<Value>) -> Arc<Fiber> {
        self.context.call_later(function, args)
    }

    /// Look up a live fiber
    pub fn fiber(&self, id: FiberId) -> Option<Arc<Fiber>> {
        self.context.queue().get(id)
    }

    /// Number of fibers not yet terminated
    pub fn live_fibers(&self) -> usize {
        self.context.queue().live_count()
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        let queue = self.context.queue();
        SchedulerStats {
            fibers_spawned: queue.spawned(),
            fibers_completed: queue.completed(),
            live_fibers: queue.live_count(),
        }
    }

    /// Run queued fibers on the calling thread until the queue is empty
    ///
    /// Returns the number of execution slices performed. Fibers parked on
    /// futures nobody completes stay live.
    pub fn run_until_idle(&self) -> usize {
        let queue = self.context.queue();
        let mut slices = 0;
        while let Some(fiber) = queue.pop() {
            self.run_fiber(fiber);
            slices += 1;
        }
        slices
    }

    /// Run queued fibers on `workers` threads until the queue drains
    ///
    /// With `workers == 0` the configured worker count is used. A worker
    /// exits once the queue is empty and no other worker is busy.
    pub fn run_workers(&self, workers: usize) {
        let workers = if workers == 0 {
            self.context.options().effective_workers()
        } else {
            workers
        };
        let queue = self.context.queue();

        std::thread::scope(|scope| {
            for worker in 0..workers {
                scope.spawn(move || {
                    debug!(worker, "worker started");
                    loop {
                        queue.enter();
                        match queue.pop() {
                            Some(fiber) => {
                                self.run_fiber(fiber);
                                queue.leave();
                            }
                            None => {
                                if queue.leave() == 0 && queue.is_empty() {
                                    break;
                                }
                                std::thread::yield_now();
                            }
                        }
                    }
                    debug!(worker, "worker stopped");
                });
            }
        });
    }

    fn run_fiber(&self, fiber: Arc<Fiber>) {
        let queue = self.context.queue();
        match fiber.execute() {
            FiberStatus::Completed(_) | FiberStatus::Failed(_) => queue.retire(fiber.id()),
            FiberStatus::Aborted(err) => {
                if fiber.is_terminated() {
                    queue.retire(fiber.id());
                } else {
                    warn!(fiber = %fiber.id(), error = %err, "fiber not runnable");
                }
            }
            FiberStatus::Parked => {}
            FiberStatus::Yielded => queue.push(fiber),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::future::FutureHandle;
    use crate::vm::interpreter::{ControlSignal, Frame, Method, NativeArgs, ReturnTarget, Target};
    use crate::vm::scheduler::FiberState;
    use crate::vm::types::ExceptionKind;
    use crate::vm::VmResult;

    fn context() -> Arc<ServiceContext> {
        ServiceContext::builder("test").build()
    }

    fn native(
        name: &str,
        argc: usize,
        f: impl Fn(&mut Frame, NativeArgs) -> VmResult<ControlSignal> + Send + Sync + 'static,
    ) -> FunctionHandle {
        FunctionHandle::new(Arc::new(Method::native(name, argc, f)))
    }

    fn single(ret: &ReturnTarget) -> Target {
        match ret {
            ReturnTarget::Single(target) => *target,
            ReturnTarget::Multi(_) => Target::Unused,
        }
    }

    #[test]
    fn test_spawn_and_complete() {
        let scheduler = Scheduler::new(context());
        let f = native("answer", 0, |frame, args| frame.assign_to(&args.ret, Value::int(42)));

        let fiber = scheduler.spawn(f, vec![]);
        assert_eq!(scheduler.live_fibers(), 1);
        assert_eq!(fiber.state(), FiberState::Created);

        assert_eq!(scheduler.run_until_idle(), 1);
        assert_eq!(fiber.state(), FiberState::Completed);
        assert_eq!(fiber.result().poll().and_then(|o| o.ok()), Some(Value::int(42)));
        assert_eq!(scheduler.live_fibers(), 0);
        assert!(scheduler.fiber(fiber.id()).is_none());
    }

    #[test]
    fn test_arguments_reach_the_function() {
        let scheduler = Scheduler::new(context());
        let f = native("sum", 2, |frame, args| {
            let a = args.arg(0).as_int().unwrap_or(0);
            let b = args.arg(1).as_int().unwrap_or(0);
            frame.assign_to(&args.ret, Value::int(a + b))
        });

        let fiber = scheduler.spawn(f, vec![Value::int(2), Value::int(3)]);
        scheduler.run_until_idle();
        assert_eq!(fiber.result().poll().and_then(|o| o.ok()), Some(Value::int(5)));
    }

    #[test]
    fn test_void_function_completes_with_null() {
        let scheduler = Scheduler::new(context());
        let f = native("noop", 0, |_, _| Ok(ControlSignal::Next));

        let fiber = scheduler.spawn(f, vec![]);
        scheduler.run_until_idle();
        assert_eq!(fiber.result().poll().and_then(|o| o.ok()), Some(Value::Null));
    }

    #[test]
    fn test_parked_fiber_resumes_on_completion() {
        let scheduler = Scheduler::new(context());
        let future = FutureHandle::new();

        let waiting = future.clone();
        let f = native("wait", 0, move |frame, args| {
            frame.await_future(waiting.clone(), single(&args.ret))
        });

        let fiber = scheduler.spawn(f, vec![]);
        scheduler.run_until_idle();
        assert_eq!(fiber.state(), FiberState::Parked);
        assert_eq!(scheduler.live_fibers(), 1);
        assert!(fiber.result().poll().is_none());

        future.complete(Value::int(7)).unwrap();
        assert_eq!(fiber.state(), FiberState::Resumed);
        scheduler.run_until_idle();
        assert_eq!(fiber.state(), FiberState::Completed);
        assert_eq!(fiber.result().poll().and_then(|o| o.ok()), Some(Value::int(7)));
    }

    #[test]
    fn test_reparked_fiber_keeps_one_callback_per_future() {
        let scheduler = Scheduler::new(context());
        let (a, b) = (FutureHandle::new(), FutureHandle::new());
        let (wait_a, wait_b) = (a.clone(), b.clone());
        let f = native("both", 2, move |frame, _| {
            frame.await_future(wait_a.clone(), Target::Register(1))?;
            frame.await_future(wait_b.clone(), Target::Register(2))
        });

        let fiber = scheduler.spawn(f, vec![Value::Null, Value::Null]);
        scheduler.run_until_idle();
        assert_eq!(fiber.state(), FiberState::Parked);
        assert_eq!(fiber.subscriptions(), 2);

        a.complete(Value::int(1)).unwrap();
        scheduler.run_until_idle();
        assert_eq!(fiber.state(), FiberState::Parked);
        assert_eq!(fiber.subscriptions(), 1);

        b.complete(Value::int(2)).unwrap();
        scheduler.run_until_idle();
        assert_eq!(fiber.state(), FiberState::Completed);
        assert_eq!(fiber.subscriptions(), 0);
    }

    #[test]
    fn test_failed_wait_fails_the_fiber() {
        let ctx = context();
        let scheduler = Scheduler::new(ctx.clone());
        let future = FutureHandle::new();

        let waiting = future.clone();
        let f = native("wait", 0, move |frame, args| {
            frame.await_future(waiting.clone(), single(&args.ret))
        });
        let fiber = scheduler.spawn(f, vec![]);
        scheduler.run_until_idle();

        let e = ctx.types().exception(ExceptionKind::Exception, "lost");
        future.fail(e.clone()).unwrap();
        scheduler.run_until_idle();
        assert_eq!(fiber.state(), FiberState::Failed);
        assert!(fiber.result().failure().unwrap().ptr_eq(&e));
    }

    #[test]
    fn test_uncaught_exception_fails_the_fiber() {
        let scheduler = Scheduler::new(context());
        let f = native("boom", 0, |frame, _| {
            Ok(frame.raise_error(ExceptionKind::IllegalState, "boom"))
        });

        let fiber = scheduler.spawn(f, vec![]);
        scheduler.run_until_idle();
        assert_eq!(fiber.state(), FiberState::Failed);
        let failure = fiber.result().failure().unwrap();
        assert_eq!(failure.message(), "boom");
        assert!(failure.stack_trace().is_some());
    }

    #[test]
    fn test_fatal_error_aborts_the_fiber() {
        let scheduler = Scheduler::new(context());
        let f = native("broken", 0, |_, _| Err(crate::vm::VmError::AlreadyReturned));

        let fiber = scheduler.spawn(f, vec![]);
        scheduler.run_until_idle();
        assert_eq!(fiber.state(), FiberState::Failed);
        assert!(fiber.result().failure().unwrap().message().starts_with("Fatal:"));
        assert_eq!(scheduler.live_fibers(), 0);
    }

    #[test]
    fn test_terminated_fiber_is_not_rerun() {
        let scheduler = Scheduler::new(context());
        let f = native("answer", 0, |frame, args| frame.assign_to(&args.ret, Value::int(1)));
        let fiber = scheduler.spawn(f, vec![]);
        scheduler.run_until_idle();

        assert!(matches!(fiber.execute(), FiberStatus::Aborted(_)));
        assert_eq!(fiber.state(), FiberState::Completed);
    }

    #[test]
    fn test_workers_drain_the_queue() {
        let scheduler = Scheduler::new(context());
        let fibers: Vec<_> = (0..16)
            .map(|i| {
                let f = native("id", 1, |frame, args| {
                    let value = args.arg(0);
                    frame.assign_to(&args.ret, value)
                });
                scheduler.spawn(f, vec![Value::int(i)])
            })
            .collect();

        scheduler.run_workers(4);
        for (i, fiber) in fibers.iter().enumerate() {
            assert_eq!(fiber.result().poll().and_then(|o| o.ok()), Some(Value::int(i as i64)));
        }
        let stats = scheduler.stats();
        assert_eq!(stats.fibers_spawned, 16);
        assert_eq!(stats.fibers_completed, 16);
        assert_eq!(stats.live_fibers, 0);
    }
}
