//! Composition handles

use std::fmt;
use std::sync::Arc;

/// Identifier of a registered composition
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositionId(pub u32);

impl CompositionId {
    /// Get the numeric ID value
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CompositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct CompositionInner {
    id: CompositionId,
    name: Arc<str>,
    parent: Option<Composition>,
    field_count: usize,
}

/// Opaque runtime type handle
///
/// Cheap to clone; two handles are the same composition iff their ids match.
#[derive(Clone)]
pub struct Composition(Arc<CompositionInner>);

impl Composition {
    pub(crate) fn new(
        id: CompositionId,
        name: impl Into<Arc<str>>,
        parent: Option<Composition>,
        field_count: usize,
    ) -> Self {
        Self(Arc::new(CompositionInner {
            id,
            name: name.into(),
            parent,
            field_count,
        }))
    }

    /// Registry id
    pub fn id(&self) -> CompositionId {
        self.0.id
    }

    /// Declared name
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Direct parent, if any
    pub fn parent(&self) -> Option<&Composition> {
        self.0.parent.as_ref()
    }

    /// Number of fields an instance of this composition holds
    pub fn field_count(&self) -> usize {
        self.0.field_count
    }

    /// Is-compatible-with query: true when `other` is this composition or one
    /// of its ancestors.
    pub fn extends(&self, other: &Composition) -> bool {
        let mut current = Some(self);
        while let Some(composition) = current {
            if composition.id() == other.id() {
                return true;
            }
            current = composition.parent();
        }
        false
    }

    /// Iterate this composition followed by its ancestors, most derived first
    pub fn lineage(&self) -> impl Iterator<Item = &Composition> {
        std::iter::successors(Some(self), |c| c.parent())
    }
}

impl PartialEq for Composition {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Composition {}

impl fmt::Debug for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name(), self.id())
    }
}

impl fmt::Display for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
