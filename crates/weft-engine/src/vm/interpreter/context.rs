//! Service context
//!
//! Everything a frame needs from the hosting runtime: the composition and
//! template registries, the constant pool, options, and the run queue that
//! new fibers are scheduled on. There are no process-wide statics; two
//! contexts are two independent VMs.

use super::call_chain::FunctionHandle;
use crate::vm::object::{Access, ObjectHandle};
use crate::vm::options::VmOptions;
use crate::vm::scheduler::{Fiber, RunQueue};
use crate::vm::templates::TemplateRegistry;
use crate::vm::types::TypeRegistry;
use crate::vm::value::Value;
use crate::vm::{VmError, VmResult};
use std::fmt;
use std::sync::Arc;

/// Shared state of one service
pub struct ServiceContext {
    name: Arc<str>,
    types: Arc<TypeRegistry>,
    templates: Arc<TemplateRegistry>,
    constants: Vec<Value>,
    options: VmOptions,
    handle: ObjectHandle,
    queue: Arc<RunQueue>,
}

impl ServiceContext {
    /// Start building a context
    pub fn builder(name: impl Into<Arc<str>>) -> ServiceContextBuilder {
        ServiceContextBuilder {
            name: name.into(),
            types: None,
            templates: None,
            constants: Vec::new(),
            options: VmOptions::default(),
        }
    }

    /// Service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Composition registry
    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    /// Native method tables
    pub fn templates(&self) -> &Arc<TemplateRegistry> {
        &self.templates
    }

    /// Options
    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    /// Constant pool entry
    pub fn constant(&self, id: u32) -> VmResult<Value> {
        self.constants
            .get(id as usize)
            .cloned()
            .ok_or(VmError::UnknownConstant(id))
    }

    /// Value representing the service itself
    pub fn service_handle(&self) -> Value {
        Value::Object(self.handle.clone())
    }

    pub(crate) fn queue(&self) -> &Arc<RunQueue> {
        &self.queue
    }

    /// Run `function` with `args` on a new fiber
    ///
    /// The fiber is queued immediately; its result future completes when it
    /// terminates.
    pub fn call_later(self: &Arc<Self>, function: FunctionHandle, args: Vec<Value>) -> Arc<Fiber> {
        let fiber = Fiber::new(self.clone(), function, args);
        tracing::debug!(fiber = %fiber.id(), service = %self.name, "fiber spawned");
        self.queue.register(fiber.clone());
        fiber
    }
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("name", &self.name)
            .field("constants", &self.constants.len())
            .field("options", &self.options)
            .finish()
    }
}

/// Builder for [`ServiceContext`]
pub struct ServiceContextBuilder {
    name: Arc<str>,
    types: Option<Arc<TypeRegistry>>,
    templates: Option<Arc<TemplateRegistry>>,
    constants: Vec<Value>,
    options: VmOptions,
}

impl ServiceContextBuilder {
    /// Use an existing composition registry
    pub fn types(mut self, types: Arc<TypeRegistry>) -> Self {
        self.types = Some(types);
        self
    }

    /// Use an existing template registry
    pub fn templates(mut self, templates: Arc<TemplateRegistry>) -> Self {
        self.templates = Some(templates);
        self
    }

    /// Constant pool
    pub fn constants(mut self, constants: Vec<Value>) -> Self {
        self.constants = constants;
        self
    }

    /// Options
    pub fn options(mut self, options: VmOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the context
    ///
    /// Missing registries are created fresh; a fresh template registry has
    /// the native future templates installed.
    pub fn build(self) -> Arc<ServiceContext> {
        let types = self.types.unwrap_or_default();
        let templates = self
            .templates
            .unwrap_or_else(|| Arc::new(TemplateRegistry::with_builtins(&types)));
        let handle = ObjectHandle::new(types.builtins().service.clone()).ensure_access(Access::Public);
        Arc::new(ServiceContext {
            name: self.name,
            types,
            templates,
            constants: self.constants,
            options: self.options,
            handle,
            queue: Arc::new(RunQueue::new()),
        })
    }
}
