//! Plugin trait definitions and factory implementations

use crate::context::PluginContext;
use crate::error::DataLayerError;
use crate::event::Event;
use crate::Result;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// A third-party integration receiving page data and events.
///
/// Plugins are shared between the data layer and callers of `get_plugin`,
/// so handlers take `&self`; keep mutable state behind a lock.
pub trait Plugin: Send + Sync + 'static {
    /// Handle a broadcast event
    fn handle_event(&self, event: &Event) -> Result<()>;

    /// Access to the concrete type, for callers that know what they loaded
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a constructed plugin
pub type PluginRef = Arc<dyn Plugin>;

impl dyn Plugin {
    /// Downcast to a concrete plugin type
    pub fn downcast_ref<T: Plugin>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Trait for plugin factories that can create plugin instances
pub trait PluginFactory: Send + Sync {
    /// Create a new plugin instance from its construction context
    fn create(&self, context: PluginContext) -> Result<PluginRef>;
}

/// Plugin factory that wraps a constructor function
pub struct FnFactory<F> {
    constructor: F,
}

impl<F> FnFactory<F>
where
    F: Fn(PluginContext) -> Result<PluginRef> + Send + Sync + 'static,
{
    pub fn new(constructor: F) -> Self {
        Self { constructor }
    }
}

impl<F> PluginFactory for FnFactory<F>
where
    F: Fn(PluginContext) -> Result<PluginRef> + Send + Sync + 'static,
{
    fn create(&self, context: PluginContext) -> Result<PluginRef> {
        (self.constructor)(context)
    }
}

/// Shorthand for an `Arc`ed [`FnFactory`]
pub fn factory_fn<F>(constructor: F) -> Arc<dyn PluginFactory>
where
    F: Fn(PluginContext) -> Result<PluginRef> + Send + Sync + 'static,
{
    Arc::new(FnFactory::new(constructor))
}

pub(crate) fn panic_message(panic_info: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        format!("plugin panicked: {}", s)
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        format!("plugin panicked: {}", s)
    } else {
        "plugin panicked with unknown error".to_string()
    }
}

/// Run a factory, turning errors and panics into a construction failure
pub(crate) fn construct(
    id: &str,
    factory: &dyn PluginFactory,
    context: PluginContext,
) -> Result<PluginRef> {
    match catch_unwind(AssertUnwindSafe(|| factory.create(context))) {
        Ok(Ok(plugin)) => Ok(plugin),
        Ok(Err(e @ DataLayerError::PluginConstructionFailed { .. })) => Err(e),
        Ok(Err(e)) => Err(DataLayerError::PluginConstructionFailed {
            id: id.to_string(),
            reason: e.to_string(),
        }),
        Err(panic_info) => Err(DataLayerError::PluginConstructionFailed {
            id: id.to_string(),
            reason: panic_message(panic_info),
        }),
    }
}

/// Hand one event to a plugin, isolating the caller from its panics
pub(crate) fn deliver(id: &str, plugin: &dyn Plugin, event: &Event) -> Result<()> {
    match catch_unwind(AssertUnwindSafe(|| plugin.handle_event(event))) {
        Ok(result) => result,
        Err(panic_info) => Err(DataLayerError::EventHandlingFailed {
            id: id.to_string(),
            event: event.name().to_string(),
            reason: panic_message(panic_info),
        }),
    }
}
