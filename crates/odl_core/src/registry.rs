//! Plugin registry: identity → instance, load status and queued requests

use crate::event::Event;
use crate::plugin::{deliver, PluginRef};
use crate::Result;
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};

/// Callback fired once a requested plugin resolves or fails
pub type PluginCallback = Box<dyn FnOnce(Result<PluginRef>) + Send>;

#[derive(Default)]
struct Inbox {
    pending: VecDeque<Arc<Event>>,
    draining: bool,
    delivered: usize,
}

/// A constructed plugin with its ordered event inbox.
///
/// Events are enqueued while the layer state is locked, so every inbox
/// sees broadcasts in the same global order. Delivery happens outside that
/// lock; a handler that broadcasts re-entrantly only enqueues, and the
/// outer drain delivers the new event after the current one returns.
pub struct LoadedPlugin {
    id: String,
    plugin: PluginRef,
    inbox: Mutex<Inbox>,
}

impl LoadedPlugin {
    fn new(id: String, plugin: PluginRef, backlog: &[Arc<Event>]) -> Self {
        Self {
            id,
            plugin,
            inbox: Mutex::new(Inbox {
                pending: backlog.iter().cloned().collect(),
                ..Default::default()
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn plugin(&self) -> &PluginRef {
        &self.plugin
    }

    /// Number of events handed to the plugin so far
    pub fn delivered(&self) -> usize {
        self.inbox().delivered
    }

    fn inbox(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn enqueue(&self, event: Arc<Event>) {
        self.inbox().pending.push_back(event);
    }

    /// Deliver queued events in order until the inbox is empty
    pub(crate) fn drain(&self) {
        {
            let mut inbox = self.inbox();
            if inbox.draining {
                return;
            }
            inbox.draining = true;
        }

        loop {
            let event = {
                let mut inbox = self.inbox();
                match inbox.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        inbox.draining = false;
                        return;
                    }
                }
            };

            debug!("📨 Delivering '{}' to plugin '{}'", event, self.id);
            if let Err(e) = deliver(&self.id, self.plugin.as_ref(), &event) {
                error!("❌ {}", e);
            }
            self.inbox().delivered += 1;
        }
    }
}

enum Slot {
    Pending(SmallVec<[PluginCallback; 2]>),
    Resolved(Arc<LoadedPlugin>),
}

/// State of a plugin id as seen by a lookup
pub enum Lookup {
    Absent,
    Pending,
    Resolved(PluginRef),
}

struct QueuedRequest {
    id: String,
    callback: Option<PluginCallback>,
}

/// Ordered plugin requests made before initialization
#[derive(Default)]
pub struct PluginQueue {
    requests: VecDeque<QueuedRequest>,
}

impl PluginQueue {
    fn push(&mut self, id: &str, callback: Option<PluginCallback>) {
        self.requests.push_back(QueuedRequest {
            id: id.to_string(),
            callback,
        });
    }

    fn contains(&self, id: &str) -> bool {
        self.requests.iter().any(|request| request.id == id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Tracks every plugin the layer knows about
#[derive(Default)]
pub struct PluginRegistry {
    slots: HashMap<String, Slot>,
    /// Resolved plugins in resolution order
    resolved: Vec<Arc<LoadedPlugin>>,
    queue: PluginQueue,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, id: &str) -> Lookup {
        match self.slots.get(id) {
            None => Lookup::Absent,
            Some(Slot::Pending(_)) => Lookup::Pending,
            Some(Slot::Resolved(loaded)) => Lookup::Resolved(loaded.plugin.clone()),
        }
    }

    /// Resolved, pending or queued
    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id) || self.queue.contains(id)
    }

    /// Record a request made before initialization
    pub fn enqueue_request(&mut self, id: &str, callback: Option<PluginCallback>) {
        self.queue.push(id, callback);
    }

    /// Take every queued request, oldest first
    pub fn take_queued(&mut self) -> Vec<(String, Option<PluginCallback>)> {
        self.queue
            .requests
            .drain(..)
            .map(|request| (request.id, request.callback))
            .collect()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Mark `id` as loading. Must happen before the load starts.
    pub fn mark_pending(&mut self, id: &str, callback: Option<PluginCallback>) {
        let mut waiters = SmallVec::new();
        waiters.extend(callback);
        self.slots.insert(id.to_string(), Slot::Pending(waiters));
    }

    /// Attach a callback to an in-flight load
    pub fn attach(&mut self, id: &str, callback: Option<PluginCallback>) {
        if let Some(Slot::Pending(waiters)) = self.slots.get_mut(id) {
            waiters.extend(callback);
        }
    }

    /// Store a constructed plugin with `backlog` queued for delivery.
    ///
    /// If the id already resolved, the existing instance wins and the new one
    /// is dropped. Returns the stored entry and the waiters to notify.
    pub(crate) fn resolve(
        &mut self,
        id: &str,
        plugin: PluginRef,
        backlog: &[Arc<Event>],
    ) -> (Arc<LoadedPlugin>, Vec<PluginCallback>) {
        let waiters = match self.slots.remove(id) {
            Some(Slot::Resolved(existing)) => {
                self.slots
                    .insert(id.to_string(), Slot::Resolved(existing.clone()));
                return (existing, Vec::new());
            }
            Some(Slot::Pending(waiters)) => waiters.into_vec(),
            None => Vec::new(),
        };

        let loaded = Arc::new(LoadedPlugin::new(id.to_string(), plugin, backlog));
        self.resolved.push(loaded.clone());
        self.slots
            .insert(id.to_string(), Slot::Resolved(loaded.clone()));
        (loaded, waiters)
    }

    /// Forget a failed load so a later request can retry. Returns its waiters.
    pub(crate) fn fail(&mut self, id: &str) -> Vec<PluginCallback> {
        match self.slots.remove(id) {
            Some(Slot::Pending(waiters)) => waiters.into_vec(),
            Some(resolved @ Slot::Resolved(_)) => {
                self.slots.insert(id.to_string(), resolved);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Resolved plugins in resolution order
    pub fn resolved(&self) -> &[Arc<LoadedPlugin>] {
        &self.resolved
    }

    pub fn pending_len(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Pending(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Plugin;
    use serde_json::json;
    use std::any::Any;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Plugin for Recorder {
        fn handle_event(&self, event: &Event) -> Result<()> {
            self.seen.lock().unwrap().push(event.name().to_string());
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_pending_then_resolved() {
        let mut registry = PluginRegistry::new();
        assert!(matches!(registry.lookup("a"), Lookup::Absent));

        registry.mark_pending("a", Some(Box::new(|_| {})));
        registry.attach("a", Some(Box::new(|_| {})));
        assert!(matches!(registry.lookup("a"), Lookup::Pending));
        assert_eq!(registry.pending_len(), 1);

        let backlog = vec![Arc::new(Event::new("initialize", json!({})))];
        let (loaded, waiters) = registry.resolve("a", Arc::new(Recorder::default()), &backlog);
        assert_eq!(waiters.len(), 2);
        assert!(matches!(registry.lookup("a"), Lookup::Resolved(_)));

        loaded.drain();
        assert_eq!(loaded.delivered(), 1);
        let recorder = loaded.plugin().downcast_ref::<Recorder>().unwrap();
        assert_eq!(*recorder.seen.lock().unwrap(), ["initialize"]);
    }

    #[test]
    fn test_second_resolution_keeps_first_instance() {
        let mut registry = PluginRegistry::new();
        registry.mark_pending("a", None);
        let (first, _) = registry.resolve("a", Arc::new(Recorder::default()), &[]);
        let (second, waiters) = registry.resolve("a", Arc::new(Recorder::default()), &[]);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(waiters.is_empty());
        assert_eq!(registry.resolved().len(), 1);
    }

    #[test]
    fn test_queue_and_failure() {
        let mut registry = PluginRegistry::new();
        registry.enqueue_request("q", None);
        assert!(registry.contains("q"));
        assert_eq!(registry.take_queued().len(), 1);
        assert!(!registry.contains("q"));

        registry.mark_pending("f", Some(Box::new(|_| {})));
        assert_eq!(registry.fail("f").len(), 1);
        assert!(!registry.contains("f"));
    }
}
