//! Guarded regions and the exception unwinder

use super::frame::{Frame, VarStyle};
use super::signal::ControlSignal;
use crate::vm::object::ExceptionHandle;
use crate::vm::types::CompositionId;
use crate::vm::value::Value;
use crate::vm::{VmError, VmResult};
use std::sync::Arc;

/// One catch clause of a guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catch {
    /// Exception composition caught by this clause
    pub composition: CompositionId,
    /// Name of the variable the exception is bound to
    pub name: Arc<str>,
    /// Handler address relative to the guard's start address
    pub relative_address: usize,
}

impl Catch {
    /// Create a catch clause
    pub fn new(composition: CompositionId, name: impl Into<Arc<str>>, relative_address: usize) -> Self {
        Self {
            composition,
            name: name.into(),
            relative_address,
        }
    }
}

/// An active try/catch region
#[derive(Debug, Clone)]
pub struct Guard {
    start_address: usize,
    scope: usize,
    catches: Arc<[Catch]>,
}

impl Guard {
    /// Create a guard entered at `start_address`, owning scope `scope`
    pub fn new(start_address: usize, scope: usize, catches: Arc<[Catch]>) -> Self {
        Self {
            start_address,
            scope,
            catches,
        }
    }

    /// Address of the op that opened the guard
    pub fn start_address(&self) -> usize {
        self.start_address
    }

    /// Scope opened by the guard
    pub fn scope(&self) -> usize {
        self.scope
    }

    /// Catch clauses in declaration order
    pub fn catches(&self) -> &[Catch] {
        &self.catches
    }
}

impl Frame {
    /// Find a handler for `exception` among the frame's active guards
    ///
    /// Guards are searched innermost first and, within a guard, catch
    /// clauses in declaration order; the first compatible clause wins. On a
    /// match the guard's scope is rebuilt with only the exception variable
    /// in it and `Jump` to the handler is returned. Otherwise the exception
    /// is left pending and `Exception` is returned so it propagates to the
    /// caller.
    pub fn find_guard(&mut self, exception: ExceptionHandle) -> VmResult<ControlSignal> {
        if self.guards.is_empty() {
            return Err(VmError::InvalidGuard(
                "guard search in a frame without guards".into(),
            ));
        }

        let types = self.context().types().clone();
        let thrown = exception.composition().clone();

        for depth in (0..self.guards.len()).rev() {
            let guard = self.guards[depth].clone();
            for catch in guard.catches() {
                let caught = types
                    .get(catch.composition)
                    .ok_or(VmError::UnknownComposition(catch.composition.as_u32()))?;
                if !thrown.extends(&caught) {
                    continue;
                }

                if guard.scope == 0 || guard.scope > self.scope {
                    return Err(VmError::InvalidGuard(format!(
                        "guard scope {} at frame scope {}",
                        guard.scope, self.scope
                    )));
                }
                self.clear_all_scopes(guard.scope - 1)?;
                self.scope = guard.scope;
                self.guards.truncate(depth);

                let var = self.next_var[guard.scope - 1];
                self.next_var[guard.scope] = var;
                self.introduce_var(
                    var,
                    Some(thrown),
                    catch.name.clone(),
                    VarStyle::Standard,
                    Some(Value::Exception(exception)),
                )?;

                return Ok(ControlSignal::Jump(guard.start_address + catch.relative_address));
            }
        }

        self.exception = Some(exception);
        Ok(ControlSignal::Exception)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::interpreter::call_chain::{CallChain, Code, Method};
    use crate::vm::interpreter::frame::{Arg, ReturnTarget, Target};
    use crate::vm::interpreter::ServiceContext;
    use crate::vm::types::ExceptionKind;
    use std::task::Poll;

    fn frame() -> Frame {
        let context = ServiceContext::builder("guards").build();
        let code = Code::new(Vec::new(), 8, 4);
        let method = Arc::new(Method::bytecode("guarded", 0, code));
        Frame::new(context, CallChain::single(method), None, vec![], ReturnTarget::unused()).unwrap()
    }

    fn catches(frame: &Frame, clauses: &[(ExceptionKind, &str, usize)]) -> Arc<[Catch]> {
        let types = frame.context().types();
        clauses
            .iter()
            .map(|&(kind, name, rel)| Catch::new(types.exception_composition(kind).id(), name, rel))
            .collect()
    }

    #[test]
    fn test_first_matching_catch_wins() {
        let mut f = frame();
        let c = catches(
            &f,
            &[
                (ExceptionKind::Arithmetic, "a", 10),
                (ExceptionKind::Exception, "e", 20),
            ],
        );
        f.enter_guard(3, c).unwrap();
        let e = f.new_exception(ExceptionKind::Arithmetic, "div by zero");
        assert_eq!(f.find_guard(e.clone()).unwrap(), ControlSignal::Jump(13));
        assert_eq!(f.guard_depth(), 0);
        assert_eq!(f.var_info(0).unwrap().name(), "a");
        assert_eq!(f.get_argument(Arg::Register(0)).unwrap(), Poll::Ready(Value::Exception(e)));
    }

    #[test]
    fn test_unwind_clears_inner_scopes() {
        let mut f = frame();
        f.introduce_next_var(None, "outer", VarStyle::Standard, Some(Value::int(1)))
            .unwrap();
        let c = catches(&f, &[(ExceptionKind::Exception, "e", 5)]);
        f.enter_guard(1, c).unwrap();
        assert_eq!(f.scope(), 1);
        f.introduce_next_var(None, "x", VarStyle::Standard, Some(Value::int(2)))
            .unwrap();
        f.enter_scope().unwrap();
        f.introduce_next_var(None, "y", VarStyle::Standard, Some(Value::int(3)))
            .unwrap();
        assert_eq!(f.scope(), 2);

        let e = f.new_exception(ExceptionKind::IllegalState, "bad");
        assert_eq!(f.find_guard(e).unwrap(), ControlSignal::Jump(6));
        assert_eq!(f.scope(), 1);
        assert_eq!(f.register(0), Some(&Value::int(1)));
        assert_eq!(f.var_info(1).unwrap().name(), "e");
        assert!(f.register(2).is_none());
        assert!(f.var_info(2).is_none());
        assert_eq!(f.next_var(), 2);
    }

    #[test]
    fn test_no_match_leaves_exception_pending() {
        let mut f = frame();
        let types = f.context().types().clone();
        let io = types
            .register("IOException", Some(types.builtins().exception.id()), 0)
            .unwrap();
        let c = catches(&f, &[(ExceptionKind::Arithmetic, "a", 4)]);
        f.enter_guard(0, c).unwrap();
        f.enter_scope().unwrap();

        let e = ExceptionHandle::new(io, "disk");
        assert_eq!(f.find_guard(e.clone()).unwrap(), ControlSignal::Exception);
        assert!(f.exception().unwrap().ptr_eq(&e));
        assert_eq!(f.guard_depth(), 1);
    }

    #[test]
    fn test_outer_guard_catches_after_inner_mismatch() {
        let mut f = frame();
        let outer = catches(&f, &[(ExceptionKind::Exception, "outer", 30)]);
        let inner = catches(&f, &[(ExceptionKind::Arithmetic, "inner", 2)]);
        f.enter_guard(0, outer).unwrap();
        f.enter_guard(5, inner).unwrap();
        let e = f.new_exception(ExceptionKind::OutOfBounds, "idx");
        assert_eq!(f.find_guard(e).unwrap(), ControlSignal::Jump(30));
        assert_eq!(f.scope(), 1);
        assert_eq!(f.guard_depth(), 0);
    }

    #[test]
    fn test_guard_search_without_guards_is_fatal() {
        let mut f = frame();
        let e = f.new_exception(ExceptionKind::Exception, "x");
        assert!(matches!(f.find_guard(e), Err(VmError::InvalidGuard(_))));
    }

    #[test]
    fn test_normal_guard_exit() {
        let mut f = frame();
        let c = catches(&f, &[(ExceptionKind::Exception, "e", 1)]);
        f.enter_guard(0, c).unwrap();
        f.assign_value(Target::Register(0), Value::int(1)).unwrap();
        f.exit_guard().unwrap();
        assert_eq!(f.scope(), 0);
        assert!(f.exit_guard().is_err());
    }
}
