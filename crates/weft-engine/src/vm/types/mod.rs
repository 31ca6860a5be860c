//! Opaque type compositions
//!
//! The core never interprets a composition beyond its name, its parent chain
//! and the number of fields an instance carries. The only query the unwinder
//! and the dispatcher need is [`Composition::extends`].

mod composition;
mod registry;

pub use composition::{Composition, CompositionId};
pub use registry::{Builtins, ExceptionKind, TypeRegistry};
