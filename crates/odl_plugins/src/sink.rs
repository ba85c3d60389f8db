//! Destination for tracker commands issued by the plugins

use serde::Serialize;
use serde_json::Value;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// One command pushed onto a vendor's command array
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerCall {
    /// Global the vendor reads from, e.g. `ga` or `_fbq`
    pub tracker: String,
    pub command: String,
    pub args: Vec<Value>,
}

impl TrackerCall {
    pub fn new(tracker: &str, command: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            tracker: tracker.to_string(),
            command: command.into(),
            args,
        }
    }
}

/// Where plugins send tracker commands and script requests
pub trait TrackerSink: Send + Sync + 'static {
    fn push(&self, call: TrackerCall);

    /// Request a vendor script to be added to the page
    fn add_script(&self, src: &str);

    fn has_script(&self, src: &str) -> bool;
}

/// Sink keeping every command and script in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<TrackerCall>>,
    scripts: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<TrackerCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Commands sent to one tracker, in order
    pub fn calls_for(&self, tracker: &str) -> Vec<TrackerCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.tracker == tracker)
            .collect()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl TrackerSink for RecordingSink {
    fn push(&self, call: TrackerCall) {
        debug!("📈 {}('{}', {:?})", call.tracker, call.command, call.args);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    fn add_script(&self, src: &str) {
        debug!("📜 Adding script {}", src);
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(src.to_string());
    }

    fn has_script(&self, src: &str) -> bool {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|s| s == src)
    }
}
