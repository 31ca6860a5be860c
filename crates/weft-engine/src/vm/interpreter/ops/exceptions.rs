//! Guarded regions and throw
//!
//! A guarded region is laid out as
//!
//! ```text
//! GUARD_START                (opens scope + guard)
//!   ...protected ops...
//! GUARD_END  +n              (closes guard, jumps past the handlers)
//! handler 1 ...  CATCH_END +m
//! handler 2 ...  CATCH_END +k
//! ```
//!
//! Handler addresses are relative to `GUARD_START`.

use super::{jump, Op};
use crate::vm::interpreter::{Arg, Catch, ControlSignal, Frame};
use crate::vm::types::ExceptionKind;
use crate::vm::value::Value;
use crate::vm::VmResult;
use std::sync::Arc;

/// Enter a guarded region
#[derive(Debug, Clone)]
pub struct GuardStart {
    /// Catch clauses in declaration order
    pub catches: Arc<[Catch]>,
}

impl Op for GuardStart {
    fn process(&self, frame: &mut Frame, pc: usize) -> VmResult<ControlSignal> {
        frame.enter_guard(pc, self.catches.clone())?;
        Ok(ControlSignal::Next)
    }

    fn name(&self) -> &'static str {
        "GUARD"
    }
}

/// Leave a guarded region normally
#[derive(Debug, Clone, Copy)]
pub struct GuardEnd {
    /// Relative offset past the handlers
    pub offset: isize,
}

impl Op for GuardEnd {
    fn process(&self, frame: &mut Frame, pc: usize) -> VmResult<ControlSignal> {
        frame.exit_guard()?;
        jump(pc, self.offset)
    }

    fn name(&self) -> &'static str {
        "GUARD_END"
    }
}

/// Leave a catch handler
#[derive(Debug, Clone, Copy)]
pub struct CatchEnd {
    /// Relative offset past the remaining handlers
    pub offset: isize,
}

impl Op for CatchEnd {
    fn process(&self, frame: &mut Frame, pc: usize) -> VmResult<ControlSignal> {
        frame.exit_scope()?;
        jump(pc, self.offset)
    }

    fn name(&self) -> &'static str {
        "CATCH_END"
    }
}

/// Raise an exception
#[derive(Debug, Clone, Copy)]
pub struct Throw {
    /// Exception value
    pub exception: Arg,
}

impl Op for Throw {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        match ready!(frame, frame.get_argument(self.exception)) {
            Value::Exception(e) => Ok(frame.raise_exception(e)),
            other => Ok(frame.raise_error(
                ExceptionKind::IllegalState,
                format!("Cannot throw {:?}", other),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "THROW"
    }
}
