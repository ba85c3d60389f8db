//! External command queue
//!
//! Page code talks to the data layer through `[method, ...args]` tuples,
//! possibly before the layer exists. [`CommandQueue`] buffers them until a
//! layer is installed and then dispatches FIFO; [`spawn_dispatch_loop`] feeds
//! a layer from a bounded channel instead.

use crate::config::LayerConfig;
use crate::error::DataLayerError;
use crate::event::Event;
use crate::orchestrator::{DataLayer, InitParams};
use crate::rules::{RuleSet, RuleSpec};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A queued call, serialized as `["method", arg0, arg1, ...]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub struct Command {
    pub method: String,
    pub args: Vec<Value>,
}

impl Command {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }

    fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index).filter(|v| !v.is_null())
    }

    fn str_arg(&self, index: usize) -> Result<&str> {
        self.arg(index).and_then(Value::as_str).ok_or_else(|| {
            DataLayerError::InvalidCommand(format!(
                "{}: argument {} must be a string",
                self.method, index
            ))
        })
    }

    fn parsed_arg<T: serde::de::DeserializeOwned + Default>(&self, index: usize) -> Result<T> {
        match self.arg(index) {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                DataLayerError::InvalidCommand(format!("{}: argument {}: {}", self.method, index, e))
            }),
            None => Ok(T::default()),
        }
    }
}

impl TryFrom<Vec<Value>> for Command {
    type Error = DataLayerError;

    fn try_from(mut tuple: Vec<Value>) -> Result<Self> {
        if tuple.is_empty() {
            return Err(DataLayerError::InvalidCommand("empty command".to_string()));
        }
        let args = tuple.split_off(1);
        match tuple.pop() {
            Some(Value::String(method)) => Ok(Command { method, args }),
            other => Err(DataLayerError::InvalidCommand(format!(
                "method name must be a string, got {}",
                other.unwrap_or(Value::Null)
            ))),
        }
    }
}

impl From<Command> for Vec<Value> {
    fn from(command: Command) -> Self {
        let mut tuple = Vec::with_capacity(command.args.len() + 1);
        tuple.push(Value::String(command.method));
        tuple.extend(command.args);
        tuple
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} arg(s))", self.method, self.args.len())
    }
}

fn normalize(method: &str) -> String {
    method
        .chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

fn broadcast_event(command: &Command) -> Result<Event> {
    match command.arg(0) {
        Some(Value::String(name)) => {
            let data = command.arg(1).cloned().unwrap_or(Value::Null);
            let event = Event::new(name, data);
            Ok(match command.arg(2).and_then(Value::as_str) {
                Some(domain) => event.with_domain(domain),
                None => event,
            })
        }
        Some(value @ Value::Object(_)) => Ok(serde_json::from_value::<Event>(value.clone())?),
        _ => Err(DataLayerError::InvalidCommand(
            "broadcast: expected an event name or an event object".to_string(),
        )),
    }
}

/// Run one command against `layer` and return its JSON result
pub fn dispatch(layer: &DataLayer, command: &Command) -> Result<Value> {
    debug!("Dispatching command {}", command);

    match normalize(&command.method).as_str() {
        "initialize" => {
            let data = command.arg(0).cloned().unwrap_or(Value::Null);
            let rules: BTreeMap<String, RuleSpec> = command.parsed_arg(1)?;
            let config: LayerConfig = command.parsed_arg(2)?;
            let local: Vec<String> = command.parsed_arg(3)?;
            let ruleset: RuleSet = rules.into_iter().collect();
            let params = InitParams::new(data)
                .with_rules(ruleset)
                .with_config(config)
                .with_local_plugins(local);
            Ok(Value::Bool(layer.initialize(params)?))
        }
        "broadcast" => {
            layer.broadcast(broadcast_event(command)?);
            Ok(Value::Null)
        }
        "getplugin" => Ok(Value::Bool(layer.get_plugin(command.str_arg(0)?).is_some())),
        "hasplugin" => Ok(Value::Bool(layer.has_plugin(command.str_arg(0)?))),
        "loadplugins" => {
            let ids: Vec<String> = command.parsed_arg(0)?;
            layer.load_plugins(ids, None);
            Ok(Value::Null)
        }
        "getdata" => Ok(layer.data().snapshot()),
        "isready" => Ok(Value::Bool(layer.is_ready())),
        "isinitialized" => Ok(Value::Bool(layer.is_initialized())),
        "intestmode" => Ok(Value::Bool(layer.in_test_mode())),
        "scanfordatamarkup" => {
            let context = command.arg(0).and_then(Value::as_str);
            layer.scan_for_data_markup(context)
        }
        "scanforeventmarkup" => {
            let context = command.arg(0).and_then(Value::as_str);
            layer.scan_for_event_markup(context)
        }
        _ => Err(DataLayerError::UnknownMethod(command.method.clone())),
    }
}

#[derive(Default)]
struct QueueState {
    layer: Option<DataLayer>,
    buffered: VecDeque<Command>,
    draining: bool,
}

/// Commands issued before the data layer exists, then dispatched FIFO
#[derive(Default)]
pub struct CommandQueue {
    state: Mutex<QueueState>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a command.
    ///
    /// Before `install` the command is buffered and `Ok(None)` is returned.
    /// Afterwards it is dispatched at once and its result returned. Commands
    /// pushed while the install drain runs are appended behind it.
    pub fn push(&self, command: Command) -> Result<Option<Value>> {
        let layer = {
            let mut state = self.state();
            match state.layer.clone() {
                Some(layer) if !state.draining => layer,
                _ => {
                    debug!("Buffering command {}", command);
                    state.buffered.push_back(command);
                    return Ok(None);
                }
            }
        };
        dispatch(&layer, &command).map(Some)
    }

    /// Attach the data layer and dispatch everything buffered, in order.
    ///
    /// Each command's failure is logged and reported in the returned list
    /// without stopping the ones behind it.
    pub fn install(&self, layer: DataLayer) -> Vec<Result<Value>> {
        {
            let mut state = self.state();
            if state.layer.is_some() {
                warn!("⚠️ Command queue already has a data layer installed");
                return Vec::new();
            }
            state.layer = Some(layer.clone());
            state.draining = true;
        }

        let mut results = Vec::new();
        loop {
            let command = {
                let mut state = self.state();
                match state.buffered.pop_front() {
                    Some(command) => command,
                    None => {
                        state.draining = false;
                        break;
                    }
                }
            };
            let result = dispatch(&layer, &command);
            if let Err(e) = &result {
                error!("❌ Command {} failed: {}", command, e);
            }
            results.push(result);
        }
        results
    }

    /// Commands waiting for dispatch
    pub fn pending(&self) -> usize {
        self.state().buffered.len()
    }

    pub fn is_installed(&self) -> bool {
        self.state().layer.is_some()
    }
}

/// Feed `layer` from a bounded channel on a background task.
///
/// The task ends when every sender has been dropped.
pub fn spawn_dispatch_loop(layer: DataLayer, capacity: usize) -> (mpsc::Sender<Command>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Command>(capacity.max(1));
    let handle = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match dispatch(&layer, &command) {
                Ok(result) => debug!("Command {} returned {}", command, result),
                Err(e) => error!("❌ Command {} failed: {}", command, e),
            }
        }
        debug!("Command dispatch loop finished");
    });
    (tx, handle)
}
