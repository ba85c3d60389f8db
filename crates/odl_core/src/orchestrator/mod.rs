//! The data layer orchestrator
//!
//! [`DataLayer`] drives the one-time initialization sequence (validation,
//! metadata and identity collection, rule evaluation, plugin loading) and then
//! serves `broadcast`, `get_plugin` and `load_plugins` for the lifetime of the
//! page.
//!
//! Plugins may resolve at any time, synchronously or much later. Each one is
//! handed the full broadcast history on resolution, then every later
//! broadcast, in order and exactly once. No lock is held while plugin code,
//! factories or callbacks run, so all of them may call back into the layer.

use crate::config::LayerConfig;
use crate::context::{Environment, PluginContext};
use crate::data::GlobalData;
use crate::error::DataLayerError;
use crate::event::{BroadcastQueue, Event, LayerStats};
use crate::loader::{ModuleMappings, PluginLoader};
use crate::metadata::{collect_metadata, meta_name, HANDLED_EVENT_MARKER};
use crate::plugin::{construct, panic_message, PluginFactory, PluginRef};
use crate::registry::{Lookup, LoadedPlugin, PluginCallback, PluginRegistry};
use crate::rules::{RuleEvaluator, RuleSet};
use crate::test_mode::detect_test_mode;
use crate::validate::validate_global_data;
use crate::Result;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};


/// Name of the cookie carrying the browser id
pub const IDENTITY_COOKIE: &str = "bid";

/// Lifecycle phase of the data layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Initializing,
    Initialized,
}

/// Callback fired once a batch of plugin loads completes
pub type DoneCallback = Box<dyn FnOnce() + Send>;

/// Arguments to [`DataLayer::initialize`]
#[derive(Debug, Default)]
pub struct InitParams {
    /// Global page data
    pub data: Value,
    /// Load rules per plugin id
    pub ruleset: RuleSet,
    /// Plugin override list and per-plugin configuration
    pub config: LayerConfig,
    /// Plugins loaded without rule evaluation
    pub local_plugins: Vec<String>,
    /// Factories that take precedence over the loader
    pub mappings: ModuleMappings,
}

impl InitParams {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    pub fn with_rules(mut self, ruleset: RuleSet) -> Self {
        self.ruleset = ruleset;
        self
    }

    pub fn with_config(mut self, config: LayerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_local_plugins<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.local_plugins = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mappings(mut self, mappings: ModuleMappings) -> Self {
        self.mappings = mappings;
        self
    }
}

struct LayerState {
    phase: Phase,
    config: LayerConfig,
    mappings: ModuleMappings,
    registry: PluginRegistry,
    broadcasts: BroadcastQueue,
}

struct Inner {
    loader: Arc<dyn PluginLoader>,
    environment: Environment,
    test_mode: bool,
    data: GlobalData,
    ready: watch::Sender<bool>,
    state: Mutex<LayerState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, LayerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a data layer instance. Clones share the same instance.
#[derive(Clone)]
pub struct DataLayer {
    inner: Arc<Inner>,
}

/// Non-owning back-reference handed to plugins
#[derive(Clone, Default)]
pub struct DataLayerRef {
    inner: Weak<Inner>,
}

impl DataLayerRef {
    /// The data layer, if it is still alive
    pub fn upgrade(&self) -> Option<DataLayer> {
        self.inner.upgrade().map(|inner| DataLayer { inner })
    }

    /// Broadcast through the data layer; false when it is gone
    pub fn broadcast(&self, event: Event) -> bool {
        match self.upgrade() {
            Some(layer) => {
                layer.broadcast(event);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for DataLayerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLayerRef")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// Fires a callback after a fixed number of completions
struct Countdown {
    remaining: AtomicUsize,
    done: Mutex<Option<DoneCallback>>,
}

impl Countdown {
    fn new(count: usize, done: Option<DoneCallback>) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            done: Mutex::new(done),
        }
    }

    fn tick(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let done = self
                .done
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(done) = done {
                done();
            }
        }
    }
}

impl DataLayer {
    /// Create a data layer whose plugins come only from `initialize` mappings
    pub fn new(environment: Environment) -> Self {
        Self::with_loader(environment, Arc::new(ModuleMappings::new()))
    }

    /// Create a data layer resolving unmapped plugin ids through `loader`
    pub fn with_loader(environment: Environment, loader: Arc<dyn PluginLoader>) -> Self {
        let test_mode = detect_test_mode(environment.cookies.as_ref(), &environment.query);
        let (ready, _) = watch::channel(false);
        debug!("Data layer created (test mode: {})", test_mode);

        Self {
            inner: Arc::new(Inner {
                loader,
                environment,
                test_mode,
                data: GlobalData::default(),
                ready,
                state: Mutex::new(LayerState {
                    phase: Phase::Uninitialized,
                    config: LayerConfig::default(),
                    mappings: ModuleMappings::default(),
                    registry: PluginRegistry::new(),
                    broadcasts: BroadcastQueue::new(),
                }),
            }),
        }
    }

    /// Non-owning handle for plugins
    pub fn downgrade(&self) -> DataLayerRef {
        DataLayerRef {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Run the one-time initialization sequence.
    ///
    /// Returns `Ok(false)` if the layer was already initialized, and an error
    /// without touching any state if the data fails validation.
    pub fn initialize(&self, params: InitParams) -> Result<bool> {
        {
            let mut state = self.inner.state();
            if state.phase != Phase::Uninitialized {
                warn!("⚠️ Data layer already initialized");
                return Ok(false);
            }
            state.phase = Phase::Initializing;
        }

        let InitParams {
            data,
            ruleset,
            config,
            local_plugins,
            mappings,
        } = params;

        let data = match self.prepare_data(data) {
            Ok(data) => data,
            Err(e) => {
                self.inner.state().phase = Phase::Uninitialized;
                error!("❌ Initialization failed: {}", e);
                return Err(e);
            }
        };
        self.inner.data.replace(data);
        self.collect_identity();
        debug!("Collected data: {}", self.inner.data.snapshot());

        let override_plugins = config.plugins.clone();
        {
            let mut state = self.inner.state();
            state.config = config;
            state.mappings = mappings;
            state.phase = Phase::Initialized;
        }
        info!("🚀 Data layer initialized");

        self.broadcast(Event::new("initialize", self.inner.data.snapshot()));

        let evaluator = RuleEvaluator::new(self.inner.test_mode);
        let mut selected = evaluator.select(&ruleset, &self.inner.data.snapshot());
        if let Some(plugins) = override_plugins {
            info!("🔧 Overriding selected plugins with configured list {:?}", plugins);
            selected = plugins;
        }

        info!("🔌 Loading {} plugin(s): {:?}", selected.len(), selected);
        let layer = self.downgrade();
        self.load_plugins(
            selected,
            Some(Box::new(move || {
                if let Some(layer) = layer.upgrade() {
                    layer.finish_startup();
                }
            })),
        );

        if !local_plugins.is_empty() {
            info!("🔌 Loading local plugins: {:?}", local_plugins);
            self.load_plugins(local_plugins, None);
        }

        debug!("Scanning for {} markup", meta_name("event"));
        if let Err(e) = self.scan_for_event_markup(None) {
            debug!("Event markup scan skipped: {}", e);
        }

        Ok(true)
    }

    fn prepare_data(&self, data: Value) -> Result<Value> {
        if !data.is_object() {
            return Err(DataLayerError::MissingGlobalData);
        }
        let data = collect_metadata(
            self.inner.environment.document.as_ref(),
            &meta_name("data"),
            None,
            data,
            |item| {
                if let Err(e) = item {
                    error!("❌ {}", e);
                }
            },
        )?;
        validate_global_data(&data)?;
        Ok(data)
    }

    fn collect_identity(&self) {
        let identity = match self
            .inner
            .environment
            .cookies
            .get(IDENTITY_COOKIE)
            .filter(|bid| !bid.is_empty())
        {
            Some(bid) => json!({ "bid": bid }),
            None => {
                warn!("⚠️ Unable to read identity cookies");
                json!({})
            }
        };
        self.inner.data.update(|data| {
            if let Value::Object(map) = data {
                map.insert("identity".to_string(), identity);
            }
        });
    }

    /// Answer requests queued before initialization, then flag readiness
    fn finish_startup(&self) {
        let queued = self.inner.state().registry.take_queued();
        if !queued.is_empty() {
            info!("📬 Answering {} queued plugin request(s)", queued.len());
        }
        for (id, callback) in queued {
            self.request_plugin(&id, callback);
        }
        self.inner.ready.send_replace(true);
        info!("✅ Data layer ready");
    }

    /// Deliver an event to every resolved plugin and record it for replay
    pub fn broadcast(&self, event: Event) {
        let event = Arc::new(event);
        let targets: Vec<Arc<LoadedPlugin>> = {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            for loaded in state.registry.resolved() {
                loaded.enqueue(event.clone());
            }
            state.broadcasts.push(event.clone());
            state.registry.resolved().to_vec()
        };

        debug!("📢 Broadcasting '{}' to {} plugin(s)", event, targets.len());
        for loaded in targets {
            loaded.drain();
        }
    }

    /// Look up a plugin, starting its load if needed.
    ///
    /// Returns the instance only when it has already resolved.
    pub fn get_plugin(&self, id: &str) -> Option<PluginRef> {
        self.request_plugin(id, None)
    }

    /// Like [`get_plugin`](Self::get_plugin), with `callback` fired once the
    /// plugin is available (synchronously if it already is) or its load failed.
    pub fn get_plugin_with<F>(&self, id: &str, callback: F) -> Option<PluginRef>
    where
        F: FnOnce(Result<PluginRef>) + Send + 'static,
    {
        self.request_plugin(id, Some(Box::new(callback)))
    }

    /// Wait for a plugin to resolve
    pub async fn plugin(&self, id: &str) -> Result<PluginRef> {
        let (tx, rx) = oneshot::channel();
        self.get_plugin_with(id, move |result| {
            let _ = tx.send(result);
        });
        rx.await.map_err(|_| DataLayerError::PluginLoadFailed {
            id: id.to_string(),
            reason: "load was abandoned".to_string(),
        })?
    }

    fn request_plugin(&self, id: &str, callback: Option<PluginCallback>) -> Option<PluginRef> {
        let mut state = self.inner.state();

        if state.phase != Phase::Initialized {
            info!("⏳ Plugin '{}' queued, data layer not initialized yet", id);
            state.registry.enqueue_request(id, callback);
            return None;
        }

        match state.registry.lookup(id) {
            Lookup::Resolved(plugin) => {
                drop(state);
                debug!("Plugin '{}' already available", id);
                if let Some(callback) = callback {
                    callback(Ok(plugin.clone()));
                }
                Some(plugin)
            }
            Lookup::Pending => {
                debug!("Plugin '{}' already loading", id);
                state.registry.attach(id, callback);
                None
            }
            Lookup::Absent => {
                state.registry.mark_pending(id, callback);
                let mapped = state.mappings.get(id);
                drop(state);
                self.start_load(id.to_string(), mapped);
                None
            }
        }
    }

    /// Drive the load once inline; hand it to the runtime if it is not done.
    ///
    /// The inline poll runs inside the current runtime's context when there
    /// is one. A loader that panics, or needs a runtime when none is running,
    /// fails the load instead of unwinding into the caller.
    fn start_load(&self, id: String, mapped: Option<Arc<dyn PluginFactory>>) {
        let mut load: BoxFuture<'static, Result<Arc<dyn PluginFactory>>> = match mapped {
            Some(factory) => futures::future::ready(Ok(factory)).boxed(),
            None => {
                let loader = self.inner.loader.clone();
                let load_id = id.clone();
                async move { loader.load(&load_id).await }.boxed()
            }
        };

        let runtime = tokio::runtime::Handle::try_current().ok();
        let first_poll = {
            let _entered = runtime.as_ref().map(|handle| handle.enter());
            let waker = futures::task::noop_waker();
            let mut cx = Context::from_waker(&waker);
            catch_unwind(AssertUnwindSafe(|| load.as_mut().poll(&mut cx)))
        };

        match first_poll {
            Ok(Poll::Ready(result)) => self.complete_load(&id, result),
            Ok(Poll::Pending) => match runtime {
                Some(handle) => {
                    debug!("Plugin '{}' loading in the background", id);
                    let layer = self.clone();
                    handle.spawn(async move {
                        let result = match AssertUnwindSafe(load).catch_unwind().await {
                            Ok(result) => result,
                            Err(panic_info) => Err(DataLayerError::PluginLoadFailed {
                                id: id.clone(),
                                reason: panic_message(panic_info),
                            }),
                        };
                        layer.complete_load(&id, result);
                    });
                }
                None => {
                    let reason = "no async runtime available to drive the loader".to_string();
                    self.complete_load(&id, Err(DataLayerError::PluginLoadFailed { id: id.clone(), reason }));
                }
            },
            Err(panic_info) => {
                let reason = panic_message(panic_info);
                self.complete_load(&id, Err(DataLayerError::PluginLoadFailed { id: id.clone(), reason }));
            }
        }
    }

    fn complete_load(&self, id: &str, result: Result<Arc<dyn PluginFactory>>) {
        let outcome = result.and_then(|factory| construct(id, factory.as_ref(), self.plugin_context(id)));

        match outcome {
            Ok(plugin) => {
                let (loaded, waiters) = {
                    let mut guard = self.inner.state();
                    let state = &mut *guard;
                    state
                        .registry
                        .resolve(id, plugin, state.broadcasts.snapshot())
                };
                info!("✅ Plugin '{}' newly loaded", id);
                loaded.drain();

                let plugin = loaded.plugin().clone();
                for waiter in waiters {
                    waiter(Ok(plugin.clone()));
                }
            }
            Err(e) => {
                error!("❌ Failed to load plugin '{}': {}", id, e);
                let waiters = self.inner.state().registry.fail(id);
                for waiter in waiters {
                    waiter(Err(e.clone()));
                }
            }
        }
    }

    fn plugin_context(&self, id: &str) -> PluginContext {
        let config = self.inner.state().config.for_plugin(id);
        PluginContext::new(
            id,
            self.downgrade(),
            self.inner.data.clone(),
            config,
            self.inner.environment.clone(),
        )
    }

    /// Request every id; `on_complete` fires once after the last load settles.
    /// Failed loads count as settled. An empty list fires it immediately.
    pub fn load_plugins<I, S>(&self, ids: I, on_complete: Option<DoneCallback>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            if let Some(done) = on_complete {
                done();
            }
            return;
        }

        let countdown = Arc::new(Countdown::new(ids.len(), on_complete));
        for id in ids {
            debug!("Loading '{}'", id);
            let countdown = countdown.clone();
            self.request_plugin(&id, Some(Box::new(move |_| countdown.tick())));
        }
    }

    /// True if the plugin is resolved, loading, or queued
    pub fn has_plugin(&self, id: &str) -> bool {
        self.inner.state().registry.contains(id)
    }

    /// Shared global data
    pub fn data(&self) -> GlobalData {
        self.inner.data.clone()
    }

    pub fn phase(&self) -> Phase {
        self.inner.state().phase
    }

    pub fn is_initialized(&self) -> bool {
        self.phase() == Phase::Initialized
    }

    /// True once every plugin selected at initialization has settled
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    pub fn in_test_mode(&self) -> bool {
        self.inner.test_mode
    }

    pub fn environment(&self) -> &Environment {
        &self.inner.environment
    }

    /// Resolves once the layer is ready
    pub async fn wait_until_ready(&self) {
        let mut ready = self.inner.ready.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Ids of resolved plugins in resolution order
    pub fn loaded_plugins(&self) -> Vec<String> {
        self.inner
            .state()
            .registry
            .resolved()
            .iter()
            .map(|loaded| loaded.id().to_string())
            .collect()
    }

    pub fn stats(&self) -> LayerStats {
        let state = self.inner.state();
        LayerStats {
            broadcasts_queued: state.broadcasts.len(),
            plugins_resolved: state.registry.resolved().len(),
            plugins_pending: state.registry.pending_len(),
            events_delivered: state
                .registry
                .resolved()
                .iter()
                .map(|loaded| loaded.delivered())
                .sum(),
        }
    }

    /// Merge `odl:data` markup (optionally below the CSS selector `context`)
    /// into the global data and return the result
    pub fn scan_for_data_markup(&self, context: Option<&str>) -> Result<Value> {
        let merged = collect_metadata(
            self.inner.environment.document.as_ref(),
            &meta_name("data"),
            context,
            self.inner.data.snapshot(),
            |item| {
                if let Err(e) = item {
                    error!("❌ {}", e);
                }
            },
        )?;
        self.inner.data.replace(merged.clone());
        Ok(merged)
    }

    /// Broadcast every `odl:event` tag not handled yet and mark it handled
    pub fn scan_for_event_markup(&self, context: Option<&str>) -> Result<Value> {
        let document = self.inner.environment.document.clone();
        let mut events = Vec::new();

        let result = collect_metadata(
            document.as_ref(),
            &meta_name("event"),
            context,
            json!({}),
            |item| match item {
                Err(e) => error!("❌ {}", e),
                Ok((tag, value)) => {
                    if document.is_handled(tag, HANDLED_EVENT_MARKER) {
                        return;
                    }
                    document.mark_handled(tag, HANDLED_EVENT_MARKER);
                    match event_from_markup(value) {
                        Some(event) => events.push(event),
                        None => warn!("⚠️ Event markup without a name: {}", value),
                    }
                }
            },
        );

        for event in events {
            self.broadcast(event);
        }
        result
    }
}

fn event_from_markup(value: &Value) -> Option<Event> {
    let name = value.get("name")?.as_str()?;
    let data = value.get("data").cloned().unwrap_or(Value::Null);
    let event = Event::new(name, data);
    Some(match value.get("domain").and_then(Value::as_str) {
        Some(domain) => event.with_domain(domain),
        None => event,
    })
}

impl fmt::Debug for DataLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLayer")
            .field("phase", &self.phase())
            .field("ready", &self.is_ready())
            .field("test_mode", &self.inner.test_mode)
            .finish()
    }
}
