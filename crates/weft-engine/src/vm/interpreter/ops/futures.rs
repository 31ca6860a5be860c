//! Waiting on futures and references

use super::Op;
use crate::vm::interpreter::{Arg, ControlSignal, Frame, Target};
use crate::vm::value::Value;
use crate::vm::VmResult;

/// Assign the eventual value of a future (or future reference) to `to`
///
/// Blocks the frame while the value is pending; a failure is raised when
/// it is observed.
#[derive(Debug, Clone, Copy)]
pub struct Wait {
    /// Future, reference, or plain value
    pub source: Arg,
    /// Destination
    pub to: Target,
}

impl Op for Wait {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        match ready!(frame, frame.get_argument(self.source)) {
            Value::Future(f) => frame.await_future(f, self.to),
            Value::Ref(r) => r.wait_and_assign(frame, self.to),
            value => frame.assign_value(self.to, value),
        }
    }

    fn name(&self) -> &'static str {
        "WAIT"
    }
}
