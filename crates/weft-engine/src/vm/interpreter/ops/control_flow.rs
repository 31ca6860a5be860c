//! Branches
//!
//! Offsets are relative to the branching op.

use super::{jump, Op};
use crate::vm::interpreter::{Arg, ControlSignal, Frame};
use crate::vm::types::ExceptionKind;
use crate::vm::VmResult;

/// Unconditional jump
#[derive(Debug, Clone, Copy)]
pub struct Jump {
    /// Relative offset
    pub offset: isize,
}

impl Op for Jump {
    fn process(&self, _frame: &mut Frame, pc: usize) -> VmResult<ControlSignal> {
        jump(pc, self.offset)
    }

    fn name(&self) -> &'static str {
        "JUMP"
    }
}

/// Jump if the value is `Null`
#[derive(Debug, Clone, Copy)]
pub struct JumpNull {
    /// Tested value
    pub value: Arg,
    /// Relative offset
    pub offset: isize,
}

impl Op for JumpNull {
    fn process(&self, frame: &mut Frame, pc: usize) -> VmResult<ControlSignal> {
        let value = ready!(frame, frame.get_argument(self.value));
        if value.is_null() {
            jump(pc, self.offset)
        } else {
            Ok(ControlSignal::Next)
        }
    }

    fn name(&self) -> &'static str {
        "JMP_NULL"
    }
}

fn branch_on(frame: &mut Frame, pc: usize, value: Arg, offset: isize, when: bool) -> VmResult<ControlSignal> {
    let value = ready!(frame, frame.get_argument(value));
    match value.as_bool() {
        Some(b) if b == when => jump(pc, offset),
        Some(_) => Ok(ControlSignal::Next),
        None => Ok(frame.raise_error(
            ExceptionKind::IllegalState,
            format!("Expected a Boolean, got {:?}", value),
        )),
    }
}

/// Jump if the value is `true`
#[derive(Debug, Clone, Copy)]
pub struct JumpTrue {
    /// Tested value
    pub value: Arg,
    /// Relative offset
    pub offset: isize,
}

impl Op for JumpTrue {
    fn process(&self, frame: &mut Frame, pc: usize) -> VmResult<ControlSignal> {
        branch_on(frame, pc, self.value, self.offset, true)
    }

    fn name(&self) -> &'static str {
        "JMP_TRUE"
    }
}

/// Jump if the value is `false`
#[derive(Debug, Clone, Copy)]
pub struct JumpFalse {
    /// Tested value
    pub value: Arg,
    /// Relative offset
    pub offset: isize,
}

impl Op for JumpFalse {
    fn process(&self, frame: &mut Frame, pc: usize) -> VmResult<ControlSignal> {
        branch_on(frame, pc, self.value, self.offset, false)
    }

    fn name(&self) -> &'static str {
        "JMP_FALSE"
    }
}
