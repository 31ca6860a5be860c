//! Register interpreter
//!
//! Frames, the control-signal protocol, guard unwinding, call chains and
//! the op set. The fetch-decode-execute loop itself lives in
//! [`Fiber`](crate::vm::scheduler::Fiber); this module only defines what a
//! single op may do to a frame and what it reports back.

mod call_chain;
mod context;
mod frame;
mod guard;
pub mod ops;
mod signal;

pub use call_chain::{
    CallChain, Code, FinalizerChain, FullyBoundHandle, FunctionHandle, Method, MethodBody,
    MethodKind, NativeArgs, NativeFn,
};
pub use context::{ServiceContext, ServiceContextBuilder};
pub use frame::{Arg, Frame, Predefined, ReturnTarget, Returned, Target, VarInfo, VarStyle};
pub use guard::{Catch, Guard};
pub use ops::{Op, OpStream};
pub use signal::{ControlSignal, Fault};
