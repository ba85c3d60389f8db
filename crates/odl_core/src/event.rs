//! Broadcast events and the replay queue

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// A named event with a JSON payload and an optional domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name (e.g. `initialize`, `addtocart`)
    pub name: CompactString,
    /// Event payload, always an object or an explicit value
    #[serde(default = "empty_object")]
    pub data: Value,
    /// Optional domain the event was raised in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Event {
    /// Create a new event. A `null` payload becomes an empty object.
    pub fn new(name: impl AsRef<str>, data: Value) -> Self {
        let data = if data.is_null() { empty_object() } else { data };
        Self {
            name: CompactString::new(name.as_ref()),
            data,
            domain: None,
        }
    }

    /// Attach a domain to the event
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Event name as a string slice
    pub fn name(&self) -> &str {
        self.name.as_str()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.domain {
            Some(domain) => write!(f, "{}@{}", self.name, domain),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Append-only record of every broadcast, replayed to late plugins
#[derive(Debug, Default)]
pub struct BroadcastQueue {
    events: Vec<Arc<Event>>,
}

impl BroadcastQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event
    pub fn push(&mut self, event: Arc<Event>) {
        self.events.push(event);
    }

    /// All recorded events, oldest first
    pub fn snapshot(&self) -> &[Arc<Event>] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Counters describing event traffic through the data layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LayerStats {
    /// Events recorded in the broadcast queue
    pub broadcasts_queued: usize,
    /// Plugins that have resolved
    pub plugins_resolved: usize,
    /// Plugins with a load in flight
    pub plugins_pending: usize,
    /// Total deliveries to plugin handlers, replays included
    pub events_delivered: usize,
}
