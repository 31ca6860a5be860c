//! Native method tables
//!
//! Natively implemented methods are looked up by composition and name in a
//! [`TemplateRegistry`] owned by the service context.

mod future;
mod registry;

pub use registry::TemplateRegistry;
