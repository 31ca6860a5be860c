//! Integer arithmetic

use super::Op;
use crate::vm::interpreter::{Arg, ControlSignal, Frame, Target};
use crate::vm::types::ExceptionKind;
use crate::vm::value::Value;
use crate::vm::VmResult;

/// Binary integer operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
}

impl ArithOp {
    fn apply(self, a: i64, b: i64) -> Result<i64, &'static str> {
        match self {
            ArithOp::Div | ArithOp::Mod if b == 0 => return Err("Division by zero"),
            _ => {}
        }
        let result = match self {
            ArithOp::Add => a.checked_add(b),
            ArithOp::Sub => a.checked_sub(b),
            ArithOp::Mul => a.checked_mul(b),
            ArithOp::Div => a.checked_div(b),
            ArithOp::Mod => a.checked_rem(b),
        };
        result.ok_or("Integer overflow")
    }
}

/// `to = lhs <op> rhs`; overflow and division by zero raise
/// `ArithmeticException`
#[derive(Debug, Clone, Copy)]
pub struct Arith {
    /// Operation
    pub op: ArithOp,
    /// Left operand
    pub lhs: Arg,
    /// Right operand
    pub rhs: Arg,
    /// Destination
    pub to: Target,
}

impl Op for Arith {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let lhs = ready!(frame, frame.get_argument(self.lhs));
        let rhs = ready!(frame, frame.get_argument(self.rhs));
        let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) else {
            return Ok(frame.raise_error(
                ExceptionKind::IllegalState,
                format!("{:?} on non-integers {:?}, {:?}", self.op, lhs, rhs),
            ));
        };
        match self.op.apply(a, b) {
            Ok(result) => frame.assign_value(self.to, Value::int(result)),
            Err(message) => Ok(frame.raise_error(ExceptionKind::Arithmetic, message)),
        }
    }

    fn name(&self) -> &'static str {
        match self.op {
            ArithOp::Add => "ADD",
            ArithOp::Sub => "SUB",
            ArithOp::Mul => "MUL",
            ArithOp::Div => "DIV",
            ArithOp::Mod => "MOD",
        }
    }
}
