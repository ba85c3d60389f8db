//! Configuration management for the data layer host.
//!
//! Loads the TOML file describing the page snapshot, plugin rules and
//! per-plugin settings, and converts it into the values the data layer
//! expects at initialization.

use odl_core::{LayerConfig, RuleSet, RuleSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

fn default_ready_timeout_ms() -> u64 {
    5000
}

fn default_user_agent() -> String {
    format!("odl/{}", env!("CARGO_PKG_VERSION"))
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub page: PageSettings,
    #[serde(default)]
    pub plugins: PluginSettings,
    /// Plugin id → declarative load rule
    #[serde(default)]
    pub rules: BTreeMap<String, RuleSpec>,
    /// Plugin id → settings handed to that plugin
    #[serde(default)]
    pub plugin_config: BTreeMap<String, Value>,
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

/// The page the data layer runs against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSettings {
    /// HTML file carrying `odl:` meta tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<PathBuf>,
    /// JSON file with the global data, merged with document metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PathBuf>,
    #[serde(default)]
    pub query: String,
    /// Raw `Cookie` header
    #[serde(default)]
    pub cookies: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Which plugins load and how long to wait for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Plugins always loaded after the selected ones, regardless of rules
    #[serde(default)]
    pub local: Vec<String>,
    /// Replaces rule evaluation with a fixed list when set
    #[serde(default, rename = "override", skip_serializing_if = "Option::is_none")]
    pub override_list: Option<Vec<String>>,
    /// How long to wait for the layer to become ready
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Default for PageSettings {
    fn default() -> Self {
        Self {
            document: None,
            data: None,
            query: String::new(),
            cookies: String::new(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            local: Vec::new(),
            override_list: None,
            ready_timeout_ms: default_ready_timeout_ms(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file does not exist, a default configuration is written to
    /// `path` and returned.
    ///
    /// # Arguments
    ///
    /// * `path` - Location of the TOML configuration file
    ///
    /// # Returns
    ///
    /// The parsed configuration, or an error if the file could not be read,
    /// parsed, or (when missing) written.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Validates the configuration before it is handed to the data layer.
    ///
    /// # Checks
    ///
    /// * **Log level** - one of `trace`, `debug`, `info`, `warn`, `error`
    /// * **Plugin ids** - local and override lists contain no empty ids
    /// * **Rules** - ids are non-empty and each condition is well formed
    /// * **Ready timeout** - `plugins.ready_timeout_ms` is greater than 0
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is usable, or a message describing the
    /// first problem found.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        let listed = self
            .plugins
            .local
            .iter()
            .chain(self.plugins.override_list.iter().flatten());
        for id in listed {
            if id.trim().is_empty() {
                return Err("Plugin ids cannot be empty".to_string());
            }
        }

        for (id, rule) in &self.rules {
            if id.trim().is_empty() {
                return Err("Rule plugin ids cannot be empty".to_string());
            }
            rule.check().map_err(|e| format!("Invalid rule for {id}: {e}"))?;
        }

        if self.plugins.ready_timeout_ms == 0 {
            return Err("plugins.ready_timeout_ms must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Converts the `[rules]` tables into a rule set, ordered by plugin id.
    pub fn to_ruleset(&self) -> RuleSet {
        self.rules
            .iter()
            .map(|(id, rule)| (id.clone(), rule.clone()))
            .collect()
    }

    /// Builds the layer configuration from the override list and the
    /// `[plugin_config]` tables.
    pub fn to_layer_config(&self) -> LayerConfig {
        let mut config = LayerConfig::new();
        if let Some(plugins) = &self.plugins.override_list {
            config = config.with_plugins(plugins.iter().cloned());
        }
        for (id, settings) in &self.plugin_config {
            config = config.with_plugin_config(id.clone(), settings.clone());
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odl_core::ConditionSpec;
    use serde_json::json;
    use tempfile::{NamedTempFile, TempDir};

    const SAMPLE: &str = r#"
[logging]
level = "debug"

[page]
query = "?emsrc=mail&refId=spring"
cookies = "bid=abc"

[plugins]
local = ["odl/plugins/marin"]
ready_timeout_ms = 250

[rules]
"odl/plugins/facebookWCA" = false

[rules."odl/plugins/ga"]
path = "page.type"
one_of = ["productdetail", "checkout-confirmation"]

[plugin_config."odl/plugins/ga"]
gaProdId = "UA-1"
gaDevId = "UA-2"
"#;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);
        assert!(config.page.document.is_none());
        assert!(config.plugins.local.is_empty());
        assert!(config.plugins.override_list.is_none());
        assert_eq!(config.plugins.ready_timeout_ms, 5000);
        assert!(config.rules.is_empty());
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("odl.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(path.exists());

        // The written default must load back
        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.plugins.ready_timeout_ms, 5000);
    }

    #[tokio::test]
    async fn test_load_from_existing_file() {
        let file = NamedTempFile::new().unwrap();
        tokio::fs::write(file.path(), SAMPLE).await.unwrap();

        let config = AppConfig::load_from_file(file.path()).await.unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.page.cookies, "bid=abc");
        assert_eq!(config.plugins.local, ["odl/plugins/marin"]);
        assert_eq!(config.plugins.ready_timeout_ms, 250);
        assert_eq!(config.rules["odl/plugins/facebookWCA"], RuleSpec::Flag(false));
        assert_eq!(
            config.rules["odl/plugins/ga"],
            RuleSpec::Condition(ConditionSpec {
                path: Some("page.type".to_string()),
                one_of: Some(vec![json!("productdetail"), json!("checkout-confirmation")]),
                ..ConditionSpec::default()
            })
        );
        assert_eq!(config.plugin_config["odl/plugins/ga"]["gaProdId"], json!("UA-1"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_conversion_to_layer_values() {
        let mut config: AppConfig = toml::from_str(SAMPLE).unwrap();
        let rules = config.to_ruleset();
        assert_eq!(rules.len(), 2);

        let layer_config = config.to_layer_config();
        assert!(layer_config.plugins.is_none());
        assert_eq!(layer_config.for_plugin("odl/plugins/ga")["gaDevId"], json!("UA-2"));
        assert_eq!(layer_config.for_plugin("odl/plugins/marin"), json!({}));

        config.plugins.override_list = Some(vec!["odl/plugins/marin".to_string()]);
        assert_eq!(
            config.to_layer_config().plugins,
            Some(vec!["odl/plugins/marin".to_string()])
        );
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = AppConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_rules() {
        let mut config = AppConfig::default();
        config.rules.insert(
            "odl/plugins/ga".to_string(),
            RuleSpec::Condition(ConditionSpec {
                equals: Some(json!("x")),
                ..ConditionSpec::default()
            }),
        );
        assert!(config.validate().unwrap_err().contains("odl/plugins/ga"));

        let mut config = AppConfig::default();
        config.plugins.local = vec![" ".to_string()];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.plugins.ready_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_rule_keys_rejected() {
        let toml = r#"
[rules."odl/plugins/ga"]
path = "page.type"
matches = "x"
"#;
        assert!(toml::from_str::<AppConfig>(toml).is_err());
    }
}
