//! Scope, variable and data movement ops

use super::Op;
use crate::vm::interpreter::{Arg, ControlSignal, Frame, Target, VarStyle};
use crate::vm::reference::RefHandle;
use crate::vm::types::{Composition, CompositionId, ExceptionKind};
use crate::vm::value::Value;
use crate::vm::VmResult;
use std::sync::Arc;

fn resolve(frame: &Frame, id: Option<CompositionId>) -> VmResult<Option<Composition>> {
    id.map(|id| frame.context().types().resolve(id)).transpose()
}

/// Do nothing
#[derive(Debug, Clone, Copy)]
pub struct Nop;

impl Op for Nop {
    fn process(&self, _frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        Ok(ControlSignal::Next)
    }

    fn name(&self) -> &'static str {
        "NOP"
    }
}

/// Open a nested scope
#[derive(Debug, Clone, Copy)]
pub struct Enter;

impl Op for Enter {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        frame.enter_scope()?;
        Ok(ControlSignal::Next)
    }

    fn name(&self) -> &'static str {
        "ENTER"
    }
}

/// Close the current scope
#[derive(Debug, Clone, Copy)]
pub struct Exit;

impl Op for Exit {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        frame.exit_scope()?;
        Ok(ControlSignal::Next)
    }

    fn name(&self) -> &'static str {
        "EXIT"
    }
}

/// Introduce an unassigned variable
#[derive(Debug, Clone)]
pub struct Var {
    /// Register
    pub index: usize,
    /// Declared composition
    pub composition: Option<CompositionId>,
    /// Variable name
    pub name: Arc<str>,
}

impl Op for Var {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let composition = resolve(frame, self.composition)?;
        frame.introduce_var(self.index, composition, self.name.clone(), VarStyle::Standard, None)?;
        Ok(ControlSignal::Next)
    }

    fn name(&self) -> &'static str {
        "VAR"
    }
}

/// Introduce a variable with an initial value
#[derive(Debug, Clone)]
pub struct VarN {
    /// Register
    pub index: usize,
    /// Declared composition
    pub composition: Option<CompositionId>,
    /// Variable name
    pub name: Arc<str>,
    /// Initial value
    pub value: Arg,
}

impl Op for VarN {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let value = ready!(frame, frame.get_argument(self.value));
        let composition = resolve(frame, self.composition)?;
        frame.introduce_var(self.index, composition, self.name.clone(), VarStyle::Standard, None)?;
        frame.assign_value(Target::Register(self.index), value)
    }

    fn name(&self) -> &'static str {
        "VAR_N"
    }
}

/// Introduce a dynamic-reference variable
///
/// With `future` set the variable is a forward reference that is assigned
/// once, possibly by another fiber; reads wait for it.
#[derive(Debug, Clone)]
pub struct VarDynamic {
    /// Register
    pub index: usize,
    /// Declared composition
    pub composition: Option<CompositionId>,
    /// Variable name
    pub name: Arc<str>,
    /// Whether the reference is future-backed
    pub future: bool,
}

impl Op for VarDynamic {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let composition = resolve(frame, self.composition)?;
        let r = if self.future {
            RefHandle::future_var(self.name.clone())
        } else {
            RefHandle::var(self.name.clone(), None)
        };
        frame.introduce_var(
            self.index,
            composition,
            self.name.clone(),
            VarStyle::DynamicRef,
            Some(Value::Ref(r)),
        )?;
        Ok(ControlSignal::Next)
    }

    fn name(&self) -> &'static str {
        "VAR_DYNAMIC"
    }
}

/// Copy a value
#[derive(Debug, Clone, Copy)]
pub struct Move {
    /// Source
    pub from: Arg,
    /// Destination
    pub to: Target,
}

impl Op for Move {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let value = ready!(frame, frame.get_argument(self.from));
        frame.assign_value(self.to, value)
    }

    fn name(&self) -> &'static str {
        "MOV"
    }
}

/// Capture a register as a reference
#[derive(Debug, Clone, Copy)]
pub struct MoveRef {
    /// Captured register
    pub register: usize,
    /// Destination of the reference
    pub to: Target,
}

impl Op for MoveRef {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let r = frame.capture_ref(self.register)?;
        frame.assign_value(self.to, Value::Ref(r))
    }

    fn name(&self) -> &'static str {
        "MOV_REF"
    }
}

/// Read an object field
#[derive(Debug, Clone, Copy)]
pub struct GetField {
    /// Object
    pub object: Arg,
    /// Field index
    pub field: usize,
    /// Destination
    pub to: Target,
}

impl Op for GetField {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let object = ready!(frame, frame.get_argument(self.object));
        let Some(handle) = object.as_object() else {
            return Ok(frame.raise_error(
                ExceptionKind::IllegalState,
                format!("Field access on non-object {:?}", object),
            ));
        };
        match handle.field(self.field) {
            Some(value) => frame.assign_value(self.to, value),
            None => Ok(frame.raise_error(
                ExceptionKind::OutOfBounds,
                format!("Field {} of {}", self.field, handle.composition()),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "P_GET"
    }
}

/// Write an object field
#[derive(Debug, Clone, Copy)]
pub struct SetField {
    /// Object
    pub object: Arg,
    /// Field index
    pub field: usize,
    /// Value
    pub value: Arg,
}

impl Op for SetField {
    fn process(&self, frame: &mut Frame, _pc: usize) -> VmResult<ControlSignal> {
        let object = ready!(frame, frame.get_argument(self.object));
        let value = ready!(frame, frame.get_argument(self.value));
        let Some(handle) = object.as_object() else {
            return Ok(frame.raise_error(
                ExceptionKind::IllegalState,
                format!("Field access on non-object {:?}", object),
            ));
        };
        if handle.set_field(self.field, value) {
            Ok(ControlSignal::Next)
        } else {
            Ok(frame.raise_error(
                ExceptionKind::OutOfBounds,
                format!("Field {} of {}", self.field, handle.composition()),
            ))
        }
    }

    fn name(&self) -> &'static str {
        "P_SET"
    }
}
