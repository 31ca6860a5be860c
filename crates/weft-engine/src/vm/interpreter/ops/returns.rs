//! Returns

use super::Op;
use crate::vm::interpreter::{Arg, ControlSignal, Frame};
use crate::vm::VmResult;

/// Return a single value
#[derive(Debug, Clone, Copy)]
pub struct Return {
    /// Returned value
    pub value: Arg,
}

impl Op for Return {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let value = ready!(frame, frame.get_argument(self.value));
        frame.return_value(value)
    }

    fn name(&self) -> &'static str {
        "RETURN_1"
    }
}

/// Return without a value
#[derive(Debug, Clone, Copy)]
pub struct ReturnVoid;

impl Op for ReturnVoid {
    fn process(&self, _frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        Ok(ControlSignal::Return)
    }

    fn name(&self) -> &'static str {
        "RETURN_0"
    }
}

/// Return several values as one tuple
#[derive(Debug, Clone)]
pub struct ReturnTuple {
    /// Tuple elements
    pub values: Vec<Arg>,
}

impl Op for ReturnTuple {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let values = ready!(frame, frame.get_arguments(&self.values));
        frame.return_tuple(values)
    }

    fn name(&self) -> &'static str {
        "RETURN_T"
    }
}

/// Return several values into several caller targets
#[derive(Debug, Clone)]
pub struct ReturnMulti {
    /// Returned values
    pub values: Vec<Arg>,
}

impl Op for ReturnMulti {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let values = ready!(frame, frame.get_arguments(&self.values));
        frame.return_multi(values)
    }

    fn name(&self) -> &'static str {
        "RETURN_N"
    }
}
