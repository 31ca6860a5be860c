//! Weft Execution Engine
//!
//! This crate provides the execution core of the Weft managed-object VM:
//! - **Frames**: register files, variable metadata, lexical scopes (`vm::interpreter::frame`)
//! - **Guards**: try/catch regions and the exception unwinder (`vm::interpreter::guard`)
//! - **Deferred values**: single-assignment futures woven into dispatch (`vm::future`)
//! - **Fibers**: cooperative scheduling of frame chains (`vm::scheduler`)
//!
//! The compiler front end, the binary module format and the full type system are
//! external collaborators; they feed this crate decoded op streams and opaque
//! compositions.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use weft_engine::vm::interpreter::ops::{Arith, ArithOp, Return};
//! use weft_engine::vm::{Arg, Code, FunctionHandle, Method, Op, Scheduler, ServiceContext};
//! use weft_engine::vm::{Target, Value};
//!
//! let context = ServiceContext::builder("main")
//!     .constants(vec![Value::int(1)])
//!     .build();
//! let ops: Vec<Arc<dyn Op>> = vec![
//!     Arc::new(Arith {
//!         op: ArithOp::Add,
//!         lhs: Arg::Register(0),
//!         rhs: Arg::Const(0),
//!         to: Target::Register(1),
//!     }),
//!     Arc::new(Return { value: Arg::Register(1) }),
//! ];
//! let add_one = Method::bytecode("addOne", 1, Code::new(ops, 2, 1));
//!
//! let scheduler = Scheduler::new(context);
//! let fiber = scheduler.spawn(FunctionHandle::new(Arc::new(add_one)), vec![Value::int(41)]);
//! scheduler.run_until_idle();
//! assert_eq!(fiber.result().poll().and_then(|o| o.ok()), Some(Value::int(42)));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::new_without_default)]
#![allow(clippy::type_complexity)]

pub mod vm;

pub use vm::{
    Arg, CallChain, Composition, CompositionId, ControlSignal, ExceptionHandle, ExceptionKind,
    Fault, Fiber, FiberId, FiberState, FiberStatus, Frame, FunctionHandle, FutureHandle, Method,
    ObjectHandle, Op, RefHandle, ReturnTarget, Scheduler, ServiceContext, Target,
    TemplateRegistry, TypeRegistry, Value, VmError, VmOptions, VmResult,
};
