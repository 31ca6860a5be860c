//! Property-based tests for futures and frame scopes

use proptest::prelude::*;
use std::sync::Arc;
use weft_engine::vm::{
    CallChain, Code, ExceptionKind, Frame, FutureHandle, Method, ReturnTarget, ServiceContext,
    Value, VarStyle,
};

const REGISTERS: usize = 48;
const SCOPES: usize = 6;

#[derive(Debug, Clone)]
enum Resolve {
    Complete(i64),
    Fail(String),
}

fn resolve_strategy() -> impl Strategy<Value = Resolve> {
    prop_oneof![
        any::<i64>().prop_map(Resolve::Complete),
        "[a-z]{1,8}".prop_map(Resolve::Fail),
    ]
}

#[derive(Debug, Clone, Copy)]
enum ScopeAction {
    Enter,
    Exit,
    Introduce,
}

fn scope_action() -> impl Strategy<Value = ScopeAction> {
    prop_oneof![
        2 => Just(ScopeAction::Enter),
        2 => Just(ScopeAction::Exit),
        3 => Just(ScopeAction::Introduce),
    ]
}

fn frame(context: &Arc<ServiceContext>) -> Frame {
    let method = Arc::new(Method::bytecode("scopes", 0, Code::new(Vec::new(), REGISTERS, SCOPES)));
    Frame::new(context.clone(), CallChain::single(method), None, vec![], ReturnTarget::unused())
        .unwrap()
}

proptest! {
    #[test]
    fn prop_future_keeps_first_resolution(
        attempts in prop::collection::vec(resolve_strategy(), 1..12)
    ) {
        let context = ServiceContext::builder("props").build();
        let future = FutureHandle::new();

        for (i, attempt) in attempts.iter().enumerate() {
            let outcome = match attempt {
                Resolve::Complete(v) => future.complete(Value::int(*v)),
                Resolve::Fail(m) => future.fail(
                    context.types().exception(ExceptionKind::Exception, m.clone()),
                ),
            };
            prop_assert_eq!(outcome.is_ok(), i == 0);
        }

        match (&attempts[0], future.poll()) {
            (Resolve::Complete(v), Some(Ok(value))) => prop_assert_eq!(value, Value::int(*v)),
            (Resolve::Fail(m), Some(Err(e))) => prop_assert_eq!(e.message(), m.as_str()),
            (first, other) => prop_assert!(false, "{:?} resolved to {:?}", first, other),
        }
    }

    #[test]
    fn prop_scope_registers_released_lifo(
        actions in prop::collection::vec(scope_action(), 1..64)
    ) {
        let context = ServiceContext::builder("props").build();
        let mut f = frame(&context);
        // Registers introduced per open scope, outermost first
        let mut open: Vec<Vec<usize>> = vec![Vec::new()];

        for action in actions {
            match action {
                ScopeAction::Enter => {
                    if f.scope() + 1 < SCOPES {
                        f.enter_scope().unwrap();
                        open.push(Vec::new());
                    }
                }
                ScopeAction::Exit => {
                    if f.scope() > 0 {
                        f.exit_scope().unwrap();
                        let released = open.pop().unwrap();
                        for index in released {
                            prop_assert!(f.register(index).is_none());
                            prop_assert!(f.var_info(index).is_none());
                        }
                    }
                }
                ScopeAction::Introduce => {
                    if f.next_var() < REGISTERS {
                        let index = f.next_var();
                        let got = f
                            .introduce_next_var(None, "v", VarStyle::Standard, Some(Value::int(index as i64)))
                            .unwrap();
                        prop_assert_eq!(got, index);
                        open.last_mut().unwrap().push(index);
                    }
                }
            }

            prop_assert_eq!(f.scope() + 1, open.len());
            for &index in open.iter().flatten() {
                prop_assert_eq!(f.register(index), Some(&Value::int(index as i64)));
            }
        }
    }
}
