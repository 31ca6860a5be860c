//! Weft VM execution core
//!
//! This module provides:
//! - Tagged runtime values and handles (`value`, `object`, `reference`, `future`)
//! - Opaque type compositions (`types`)
//! - Frames, the control-signal protocol, guard unwinding and ops (`interpreter`)
//! - Native operation tables (`templates`)
//! - Fibers and the cooperative scheduler (`scheduler`)

pub mod future;
pub mod interpreter;
pub mod object;
pub mod options;
pub mod reference;
pub mod scheduler;
pub mod templates;
pub mod types;
pub mod value;

pub use future::{AlreadyCompleted, Completion, FutureHandle, Outcome};
pub use interpreter::{
    Arg, CallChain, Catch, Code, ControlSignal, Fault, FinalizerChain, Frame, FullyBoundHandle,
    FunctionHandle, Guard, Method, MethodBody, MethodKind, NativeArgs, NativeFn, Op, OpStream,
    Predefined, ReturnTarget, Returned, ServiceContext, ServiceContextBuilder, Target, VarInfo,
    VarStyle,
};
pub use object::{Access, ExceptionHandle, ObjectHandle};
pub use options::VmOptions;
pub use reference::RefHandle;
pub use scheduler::{Fiber, FiberId, FiberState, FiberStatus, Scheduler, SchedulerStats};
pub use templates::TemplateRegistry;
pub use types::{Composition, CompositionId, ExceptionKind, TypeRegistry};
pub use value::Value;

/// VM protocol and invariant violations
///
/// These indicate a bug in the producer of the op stream (or in the host
/// driving the fibers), never a condition a program can recover from. User
/// visible failures travel as [`ExceptionHandle`]s instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// Register index beyond the frame's declared register count
    #[error("Register {index} out of range (frame has {count} registers)")]
    RegisterOutOfRange {
        /// Offending index
        index: usize,
        /// Declared register count
        count: usize,
    },

    /// Program counter beyond the op stream
    #[error("Program counter {pc} out of range (method has {len} ops)")]
    PcOutOfRange {
        /// Offending program counter
        pc: usize,
        /// Number of ops in the stream
        len: usize,
    },

    /// Scope index outside the frame's declared scope count
    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    /// Malformed guard table or guard usage
    #[error("Invalid guard: {0}")]
    InvalidGuard(String),

    /// Unknown composition id
    #[error("Unknown composition: {0}")]
    UnknownComposition(u32),

    /// Unknown constant id
    #[error("Unknown constant: {0}")]
    UnknownConstant(u32),

    /// Illegal assignment target (e.g. the multi-return marker used directly)
    #[error("Illegal target: {0}")]
    IllegalTarget(String),

    /// A predefined argument that requires a target was read in a static frame
    #[error("No target available for {0}")]
    NoTarget(&'static str),

    /// A frame reported a second completion for the same call
    #[error("Frame has already returned")]
    AlreadyReturned,

    /// Frame arena is in an unexpected shape
    #[error("Missing frame: {0}")]
    MissingFrame(&'static str),

    /// Invalid arguments supplied when building a frame or a call
    #[error("Invalid call: {0}")]
    InvalidCall(String),

    /// Internal state violation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),
}

/// VM execution result
pub type VmResult<T> = Result<T, VmError>;
