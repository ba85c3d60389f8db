//! Analytics integrations for the open data layer.
//!
//! Each plugin translates the global data and broadcast events into vendor
//! tracker commands pushed onto a [`TrackerSink`].

use odl_core::{factory_fn, DataLayerError, ModuleMappings, PluginContext, PluginRef};
use serde::de::DeserializeOwned;
use std::sync::Arc;

pub mod facebook;
pub mod ga;
pub mod marin;
pub mod sink;

pub use facebook::FacebookWca;
pub use ga::GoogleAnalytics;
pub use marin::Marin;
pub use sink::{RecordingSink, TrackerCall, TrackerSink};

/// Plugin id of the Google Analytics integration
pub const GA_ID: &str = "odl/plugins/ga";
/// Plugin id of the Facebook website custom audience integration
pub const FACEBOOK_WCA_ID: &str = "odl/plugins/facebookWCA";
/// Plugin id of the Marin conversion integration
pub const MARIN_ID: &str = "odl/plugins/marin";

/// Id → factory mappings for every bundled plugin, all writing to `sink`
pub fn mappings(sink: Arc<dyn TrackerSink>) -> ModuleMappings {
    let ga_sink = sink.clone();
    let fb_sink = sink.clone();
    let marin_sink = sink;

    ModuleMappings::new()
        .with(
            GA_ID,
            factory_fn(move |ctx| {
                Ok(Arc::new(GoogleAnalytics::new(&ctx, ga_sink.clone())?) as PluginRef)
            }),
        )
        .with(
            FACEBOOK_WCA_ID,
            factory_fn(move |ctx| {
                Ok(Arc::new(FacebookWca::new(&ctx, fb_sink.clone())?) as PluginRef)
            }),
        )
        .with(
            MARIN_ID,
            factory_fn(move |ctx| Ok(Arc::new(Marin::new(&ctx, marin_sink.clone())?) as PluginRef)),
        )
}

/// Deserialize the plugin's own configuration
pub(crate) fn plugin_config<T: DeserializeOwned>(ctx: &PluginContext) -> odl_core::Result<T> {
    serde_json::from_value(ctx.config().clone()).map_err(|e| {
        DataLayerError::PluginConstructionFailed {
            id: ctx.id().to_string(),
            reason: format!("invalid configuration: {}", e),
        }
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use odl_core::{DataLayer, Environment, InitParams, LayerConfig, RuleSet};
    use serde_json::Value;

    /// Initialize a layer loading only `id`, configured with `config`
    pub fn layer_with(
        id: &str,
        data: Value,
        config: Value,
        query: &str,
    ) -> (DataLayer, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let layer = DataLayer::new(
            Environment::new()
                .with_query(query)
                .with_user_agent("Mozilla/5.0 (X11; Linux x86_64)"),
        );
        let params = InitParams::new(data)
            .with_rules(RuleSet::new().with(id, true))
            .with_config(LayerConfig::new().with_plugin_config(id, config))
            .with_mappings(mappings(sink.clone()));
        assert_eq!(layer.initialize(params), Ok(true));
        (layer, sink)
    }
}
