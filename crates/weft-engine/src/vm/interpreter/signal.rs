//! Control signals reported by ops

use crate::vm::object::ExceptionHandle;
use crate::vm::VmError;

/// Outcome of processing one op
///
/// The dispatch loop interprets these to advance, branch, switch frames,
/// suspend or unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Advance to the next op in the same frame
    Next,
    /// Continue at the given address in the same frame
    Jump(usize),
    /// A callee frame has been attached as the frame's next frame
    Call,
    /// The frame has completed normally
    Return,
    /// The frame has delivered an exception to its caller
    ReturnException,
    /// A value dependency is pending; the op itself has completed
    Block,
    /// A return was delivered into a register that is now waiting
    BlockReturn,
    /// An exception is pending in the frame and must be unwound
    Exception,
    /// Retry the same op once the dependency is ready
    Repeat,
}

impl ControlSignal {
    /// Whether the signal ends the frame
    pub fn is_return(self) -> bool {
        matches!(
            self,
            ControlSignal::Return | ControlSignal::ReturnException | ControlSignal::BlockReturn
        )
    }
}

/// Failure raised while executing an op
///
/// `Exception` is a program-visible failure and is routed through guard
/// unwinding; `Fatal` is a protocol violation and aborts the fiber.
#[derive(Debug, Clone)]
pub enum Fault {
    /// User-level exception
    Exception(ExceptionHandle),
    /// Invariant violation
    Fatal(VmError),
}

impl From<ExceptionHandle> for Fault {
    fn from(e: ExceptionHandle) -> Self {
        Fault::Exception(e)
    }
}

impl From<VmError> for Fault {
    fn from(e: VmError) -> Self {
        Fault::Fatal(e)
    }
}
