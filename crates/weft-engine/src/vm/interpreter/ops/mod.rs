//! Op set
//!
//! Every op implements [`Op::process`]: it reads and writes the frame it is
//! given and reports a [`ControlSignal`]. Program-visible failures are
//! raised into the frame (`Exception`); only protocol violations surface as
//! `Err`.

use super::frame::Frame;
use super::signal::ControlSignal;
use crate::vm::{VmError, VmResult};
use std::fmt;
use std::sync::Arc;

/// Unwrap a frame read inside `process`
///
/// A pending read repeats the op, a fault is raised into the frame.
macro_rules! ready {
    ($frame:expr, $read:expr) => {
        match $read {
            Ok(std::task::Poll::Ready(value)) => value,
            Ok(std::task::Poll::Pending) => {
                return Ok($crate::vm::interpreter::ControlSignal::Repeat)
            }
            Err(fault) => return $frame.raise(fault),
        }
    };
}

mod arith;
mod calls;
mod control_flow;
mod exceptions;
mod futures;
mod returns;
mod scope;

pub use arith::{Arith, ArithOp};
pub use calls::{BindArg, BindMethod, Call, CallSuper, Construct, Invoke, New, CONSTRUCTOR};
pub use control_flow::{Jump, JumpFalse, JumpNull, JumpTrue};
pub use exceptions::{CatchEnd, GuardEnd, GuardStart, Throw};
pub use futures::Wait;
pub use returns::{Return, ReturnMulti, ReturnTuple, ReturnVoid};
pub use scope::{Enter, Exit, GetField, Move, MoveRef, Nop, SetField, Var, VarDynamic, VarN};

/// A decoded instruction
pub trait Op: Send + Sync + fmt::Debug {
    /// Execute against `frame`; `pc` is this op's address
    fn process(&self, frame: &mut Frame, pc: usize) -> VmResult<ControlSignal>;

    /// Mnemonic, for traces and stack traces
    fn name(&self) -> &'static str;
}

/// Immutable op stream of one method
pub type OpStream = Arc<[Arc<dyn Op>]>;

/// Resolve a relative jump
pub(crate) fn jump(pc: usize, offset: isize) -> VmResult<ControlSignal> {
    pc.checked_add_signed(offset)
        .map(ControlSignal::Jump)
        .ok_or_else(|| VmError::InvalidState(format!("jump from {} by {} underflows", pc, offset)))
}
