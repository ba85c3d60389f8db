//! Data layer configuration passed to `initialize`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Plugin override list plus per-plugin configuration.
///
/// Deserializes from the flat shape `{"plugins": [...], "<plugin-id>": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    /// When set, replaces the ids selected by the rule set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Vec<String>>,
    /// Configuration handed to each plugin at construction
    #[serde(flatten)]
    pub plugin_config: HashMap<String, Value>,
}

impl LayerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the selected plugin list
    pub fn with_plugins<I, S>(mut self, plugins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plugins = Some(plugins.into_iter().map(Into::into).collect());
        self
    }

    /// Set the configuration for one plugin
    pub fn with_plugin_config(mut self, id: impl Into<String>, config: Value) -> Self {
        self.plugin_config.insert(id.into(), config);
        self
    }

    /// Configuration for `id`, or an empty object
    pub fn for_plugin(&self, id: &str) -> Value {
        self.plugin_config
            .get(id)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flat_shape() {
        let config: LayerConfig = serde_json::from_value(json!({
            "plugins": ["odl/plugins/ga"],
            "odl/plugins/ga": {"gaProdId": "UA-1"}
        }))
        .unwrap();
        assert_eq!(config.plugins, Some(vec!["odl/plugins/ga".to_string()]));
        assert_eq!(config.for_plugin("odl/plugins/ga"), json!({"gaProdId": "UA-1"}));
        assert_eq!(config.for_plugin("odl/plugins/marin"), json!({}));
    }

    #[test]
    fn test_without_override() {
        let config: LayerConfig = serde_json::from_value(json!({"a": {"x": 1}})).unwrap();
        assert_eq!(config.plugins, None);
        assert_eq!(config.plugin_config.len(), 1);
    }
}
