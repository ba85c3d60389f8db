//! # Open Data Layer core
//!
//! A page-side data layer that aggregates page/site/user metadata, exposes it
//! to pluggable analytics integrations, and brokers an event channel between
//! page code and those integrations.
//!
//! ## Architecture
//!
//! - **DataLayer**: the orchestrator; one explicit instance owned by the host
//! - **PluginRegistry**: plugin id → instance, load status, queued requests
//! - **BroadcastQueue**: every broadcast, replayed to late plugins in order
//! - **RuleEvaluator**: decides which plugins load for the current page
//! - **Environment**: cookies, document metadata and query string of the page
//! - **CommandQueue**: `[method, ...args]` commands issued before or after startup
//!
//! ## Usage
//!
//! ```rust,no_run
//! use odl_core::*;
//! use serde_json::json;
//!
//! let layer = DataLayer::new(Environment::default());
//! let params = InitParams::new(json!({
//!     "page": {"type": "home", "name": "Home"},
//!     "site": {"id": "s1"},
//!     "user": {},
//! }))
//! .with_rules(RuleSet::new().with("odl/plugins/ga", true));
//!
//! assert!(layer.initialize(params)?);
//! layer.broadcast(Event::new("addtocart", json!({"sku": "A1"})));
//! # Ok::<(), DataLayerError>(())
//! ```

pub mod command;
pub mod config;
pub mod context;
pub mod cookie;
pub mod data;
pub mod error;
pub mod event;
pub mod loader;
pub mod metadata;
pub mod orchestrator;
pub mod plugin;
pub mod registry;
pub mod rules;
pub mod test_mode;
pub mod utils;
pub mod validate;

// Re-exports for convenience
pub use command::{dispatch, spawn_dispatch_loop, Command, CommandQueue};
pub use config::LayerConfig;
pub use context::{Environment, PluginContext};
pub use cookie::{CookieJar, CookieOptions, MemoryCookieJar};
pub use data::GlobalData;
pub use error::DataLayerError;
pub use event::{Event, LayerStats};
pub use loader::{ModuleMappings, PluginLoader};
pub use metadata::{collect_metadata, HtmlDocument, MetaTag, MetadataSource};
pub use orchestrator::{DataLayer, DataLayerRef, DoneCallback, InitParams, Phase};
pub use plugin::{factory_fn, FnFactory, Plugin, PluginFactory, PluginRef};
pub use rules::{ConditionSpec, Rule, RuleEvaluator, RuleSet, RuleSpec};
pub use test_mode::{detect_test_mode, TEST_MODE_COOKIE};

/// Crate version
pub const ODL_CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type used throughout the data layer
pub type Result<T> = std::result::Result<T, DataLayerError>;
