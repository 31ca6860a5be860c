//! Fibers and the cooperative scheduler
//!
//! A fiber runs its frame stack until it completes, fails, or has to wait
//! on a future. A waiting fiber is parked and re-queued by the future's
//! completion callback; fibers never block a worker thread.

mod fiber;
mod queue;
#[allow(clippy::module_inception)]
mod scheduler;

pub use fiber::{Fiber, FiberId, FiberState, FiberStatus};
pub(crate) use queue::RunQueue;
pub use scheduler::{Scheduler, SchedulerStats};
