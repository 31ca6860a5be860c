//! Composition registry
//!
//! Maps `CompositionId` to `Composition` and carries the standard compositions
//! every service needs (primitive value kinds and the exception hierarchy).

use super::composition::{Composition, CompositionId};
use crate::vm::object::ExceptionHandle;
use crate::vm::{VmError, VmResult};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Standard exception compositions raised by the core itself
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExceptionKind {
    /// Root of the exception hierarchy
    Exception,
    /// Operation not valid for the current state of a value
    IllegalState,
    /// Read of a register or reference that was never assigned
    Unassigned,
    /// Index below zero or past the end
    OutOfBounds,
    /// Integer overflow or division by zero
    Arithmetic,
    /// Frame depth limit exceeded
    StackOverflow,
}

/// Well-known compositions, resolved once at registry creation
#[derive(Debug, Clone)]
pub struct Builtins {
    /// `Object`
    pub object: Composition,
    /// `Null`
    pub null: Composition,
    /// `Boolean`
    pub boolean: Composition,
    /// `Int`
    pub int: Composition,
    /// `String`
    pub string: Composition,
    /// `Tuple`
    pub tuple: Composition,
    /// `Function`
    pub function: Composition,
    /// `Future`
    pub future: Composition,
    /// `Ref`
    pub reference: Composition,
    /// `Class`
    pub class: Composition,
    /// `Service`
    pub service: Composition,
    /// `Exception`
    pub exception: Composition,
    /// `IllegalStateException`
    pub illegal_state: Composition,
    /// `UnassignedException`
    pub unassigned: Composition,
    /// `OutOfBoundsException`
    pub out_of_bounds: Composition,
    /// `ArithmeticException`
    pub arithmetic: Composition,
    /// `StackOverflowException`
    pub stack_overflow: Composition,
}

#[derive(Default)]
struct RegistryInner {
    compositions: Vec<Composition>,
    by_name: FxHashMap<String, CompositionId>,
}

impl RegistryInner {
    fn insert(&mut self, name: &str, parent: Option<Composition>, field_count: usize) -> Composition {
        let id = CompositionId(self.compositions.len() as u32);
        let composition = Composition::new(id, name, parent, field_count);
        self.compositions.push(composition.clone());
        self.by_name.insert(name.to_string(), id);
        composition
    }
}

/// Thread-safe registry of compositions
pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
    builtins: Builtins,
}

impl TypeRegistry {
    /// Create a registry pre-populated with the standard compositions
    pub fn new() -> Self {
        let mut inner = RegistryInner::default();

        let object = inner.insert("Object", None, 0);
        let null = inner.insert("Null", Some(object.clone()), 0);
        let boolean = inner.insert("Boolean", Some(object.clone()), 0);
        let int = inner.insert("Int", Some(object.clone()), 0);
        let string = inner.insert("String", Some(object.clone()), 0);
        let tuple = inner.insert("Tuple", Some(object.clone()), 0);
        let function = inner.insert("Function", Some(object.clone()), 0);
        let future = inner.insert("Future", Some(object.clone()), 0);
        let reference = inner.insert("Ref", Some(object.clone()), 0);
        let class = inner.insert("Class", Some(object.clone()), 0);
        let service = inner.insert("Service", Some(object.clone()), 0);
        let exception = inner.insert("Exception", Some(object.clone()), 0);
        let illegal_state = inner.insert("IllegalStateException", Some(exception.clone()), 0);
        let unassigned = inner.insert("UnassignedException", Some(exception.clone()), 0);
        let out_of_bounds = inner.insert("OutOfBoundsException", Some(exception.clone()), 0);
        let arithmetic = inner.insert("ArithmeticException", Some(exception.clone()), 0);
        let stack_overflow = inner.insert("StackOverflowException", Some(exception.clone()), 0);

        Self {
            inner: RwLock::new(inner),
            builtins: Builtins {
                object,
                null,
                boolean,
                int,
                string,
                tuple,
                function,
                future,
                reference,
                class,
                service,
                exception,
                illegal_state,
                unassigned,
                out_of_bounds,
                arithmetic,
                stack_overflow,
            },
        }
    }

    /// Register a new composition under `parent` (defaults to `Object`)
    ///
    /// Registering a name twice is rejected.
    pub fn register(
        &self,
        name: &str,
        parent: Option<CompositionId>,
        field_count: usize,
    ) -> VmResult<Composition> {
        let mut inner = self.inner.write();
        if inner.by_name.contains_key(name) {
            return Err(VmError::InvalidState(format!(
                "Composition '{}' already registered",
                name
            )));
        }
        let parent = match parent {
            Some(id) => inner
                .compositions
                .get(id.0 as usize)
                .cloned()
                .ok_or(VmError::UnknownComposition(id.0))?,
            None => self.builtins.object.clone(),
        };
        Ok(inner.insert(name, Some(parent), field_count))
    }

    /// Get a composition by id
    pub fn get(&self, id: CompositionId) -> Option<Composition> {
        self.inner.read().compositions.get(id.0 as usize).cloned()
    }

    /// Get a composition by id, treating an unknown id as a protocol violation
    pub fn resolve(&self, id: CompositionId) -> VmResult<Composition> {
        self.get(id).ok_or(VmError::UnknownComposition(id.0))
    }

    /// Look a composition up by name
    pub fn by_name(&self, name: &str) -> Option<Composition> {
        let inner = self.inner.read();
        inner
            .by_name
            .get(name)
            .and_then(|id| inner.compositions.get(id.0 as usize).cloned())
    }

    /// Number of registered compositions
    pub fn len(&self) -> usize {
        self.inner.read().compositions.len()
    }

    /// Check if the registry is empty (never true for a standard registry)
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The well-known compositions
    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    /// Composition of a standard exception kind
    pub fn exception_composition(&self, kind: ExceptionKind) -> &Composition {
        let b = &self.builtins;
        match kind {
            ExceptionKind::Exception => &b.exception,
            ExceptionKind::IllegalState => &b.illegal_state,
            ExceptionKind::Unassigned => &b.unassigned,
            ExceptionKind::OutOfBounds => &b.out_of_bounds,
            ExceptionKind::Arithmetic => &b.arithmetic,
            ExceptionKind::StackOverflow => &b.stack_overflow,
        }
    }

    /// Create a standard exception handle
    pub fn exception(&self, kind: ExceptionKind, message: impl Into<String>) -> ExceptionHandle {
        ExceptionHandle::new(self.exception_composition(kind).clone(), message)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("compositions", &self.len())
            .finish()
    }
}
