//! Application lifecycle: build the page environment, initialize the data
//! layer with the bundled plugins, replay queued commands and report what the
//! trackers received.

use crate::{cli::CliArgs, config::AppConfig, logging::display_banner};
use odl_core::{
    Command, CommandQueue, DataLayer, Environment, HtmlDocument, InitParams, LayerStats,
    MemoryCookieJar,
};
use odl_plugins::{RecordingSink, TrackerCall};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Outcome of one queued command
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything the run produced, printed as JSON on stdout
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub ready: bool,
    pub test_mode: bool,
    pub plugins: Vec<String>,
    pub data: Value,
    pub stats: LayerStats,
    pub commands: Vec<CommandOutcome>,
    pub tracker_calls: Vec<TrackerCall>,
    pub scripts: Vec<String>,
    pub cookies: String,
}

pub struct Application {
    config: AppConfig,
    commands: Vec<Command>,
}

impl Application {
    /// Loads configuration, applies CLI overrides and reads queued commands.
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!("🔧 Loading configuration from: {}", args.config_path.display());
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(document) = args.document {
            config.page.document = Some(document);
        }
        if let Some(query) = args.query {
            config.page.query = query;
        }
        if let Some(cookies) = args.cookies {
            config.page.cookies = cookies;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }
        info!("✅ Configuration loaded and validated successfully");

        let commands = match &args.commands {
            Some(path) => {
                let content = tokio::fs::read_to_string(path).await?;
                let commands: Vec<Command> = serde_json::from_str(&content)?;
                info!("📥 Queued {} command(s) from {}", commands.len(), path.display());
                commands
            }
            None => Vec::new(),
        };

        Ok(Self { config, commands })
    }

    async fn environment(&self, cookies: Arc<MemoryCookieJar>) -> Result<Environment, Box<dyn std::error::Error>> {
        let document = match &self.config.page.document {
            Some(path) => HtmlDocument::new(tokio::fs::read_to_string(path).await?),
            None => HtmlDocument::empty(),
        };
        Ok(Environment::new()
            .with_cookies(cookies)
            .with_document(Arc::new(document))
            .with_query(self.config.page.query.clone())
            .with_user_agent(self.config.page.user_agent.clone()))
    }

    async fn page_data(&self) -> Result<Value, Box<dyn std::error::Error>> {
        match &self.config.page.data {
            Some(path) => Ok(serde_json::from_str(&tokio::fs::read_to_string(path).await?)?),
            None => Ok(Value::Object(Default::default())),
        }
    }

    /// Runs the data layer once and collects the report.
    pub async fn run(self) -> Result<Report, Box<dyn std::error::Error>> {
        display_banner();

        let sink = Arc::new(RecordingSink::new());
        let cookies = Arc::new(MemoryCookieJar::from_header(&self.config.page.cookies));
        let environment = self.environment(cookies.clone()).await?;
        let loader = Arc::new(odl_plugins::mappings(sink.clone()));
        let layer = DataLayer::with_loader(environment, loader);

        // Commands are queued before the layer exists, as page code would
        let queue = CommandQueue::new();
        for command in &self.commands {
            queue.push(command.clone())?;
        }

        let params = InitParams::new(self.page_data().await?)
            .with_rules(self.config.to_ruleset())
            .with_config(self.config.to_layer_config())
            .with_local_plugins(self.config.plugins.local.iter().cloned());
        layer.initialize(params)?;

        let timeout = Duration::from_millis(self.config.plugins.ready_timeout_ms);
        if tokio::time::timeout(timeout, layer.wait_until_ready()).await.is_err() {
            warn!("⏰ Data layer not ready after {}ms, reporting anyway", timeout.as_millis());
        }

        let outcomes = queue
            .install(layer.clone())
            .into_iter()
            .zip(&self.commands)
            .map(|(result, command)| match result {
                Ok(value) => CommandOutcome {
                    command: command.to_string(),
                    result: Some(value),
                    error: None,
                },
                Err(e) => {
                    error!("❌ Command {} failed: {}", command, e);
                    CommandOutcome {
                        command: command.to_string(),
                        result: None,
                        error: Some(e.to_string()),
                    }
                }
            })
            .collect();

        let report = Report {
            ready: layer.is_ready(),
            test_mode: layer.in_test_mode(),
            plugins: layer.loaded_plugins(),
            data: layer.data().snapshot(),
            stats: layer.stats(),
            commands: outcomes,
            tracker_calls: sink.calls(),
            scripts: sink.scripts(),
            cookies: cookies.header(),
        };

        info!(
            "📊 {} plugin(s) loaded, {} tracker call(s), {} event(s) delivered",
            report.plugins.len(),
            report.tracker_calls.len(),
            report.stats.events_delivered
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const PAGE: &str = r#"<html><head>
<meta name="odl:data" content='{"page":{"type":"productdetail","name":"Produkt/Schuh/12345678"},"site":{"id":"jump_live"},"user":{},"product":{"ean":"4001"}}'>
<meta name="odl:event" content='{"name":"addtocart","data":{"product":{"ean":"4001"}}}'>
</head><body></body></html>"#;

    const CONFIG: &str = r#"
[plugins]
local = ["odl/plugins/marin"]

[rules]
"odl/plugins/facebookWCA" = true

[rules."odl/plugins/ga"]
test = true

[plugin_config."odl/plugins/facebookWCA"]
pixelId = "px-1"

[plugin_config."odl/plugins/ga"]
gaProdId = "UA-PROD"
gaDevId = "UA-DEV"

[plugin_config."odl/plugins/marin"]
accountId = "m-1"
"#;

    async fn setup(dir: &TempDir, commands: Option<&str>) -> CliArgs {
        let config_path = dir.path().join("odl.toml");
        let document = dir.path().join("page.html");
        tokio::fs::write(&config_path, CONFIG).await.unwrap();
        tokio::fs::write(&document, PAGE).await.unwrap();

        let commands = match commands {
            Some(content) => {
                let path = dir.path().join("commands.json");
                tokio::fs::write(&path, content).await.unwrap();
                Some(path)
            }
            None => None,
        };

        CliArgs {
            config_path,
            document: Some(document),
            cookies: Some("bid=b-77".to_string()),
            commands,
            ..CliArgs::default()
        }
    }

    #[tokio::test]
    async fn test_run_with_document_markup() {
        let dir = TempDir::new().unwrap();
        let app = Application::new(setup(&dir, None).await).await.unwrap();
        let report = app.run().await.unwrap();

        assert!(report.ready);
        assert!(!report.test_mode);
        assert_eq!(report.plugins, ["odl/plugins/facebookWCA", "odl/plugins/marin"]);
        assert_eq!(report.data["identity"], json!({"bid": "b-77"}));
        assert_eq!(report.data["product"]["ean"], json!("4001"));

        // GA is gated on test mode
        assert!(report.tracker_calls.iter().all(|call| call.tracker != "ga"));
        let fb_events: Vec<_> = report
            .tracker_calls
            .iter()
            .filter(|call| call.tracker == "_fbq" && call.command == "track")
            .map(|call| call.args[0].clone())
            .collect();
        assert_eq!(fb_events, [json!("PixelInitialized"), json!("ViewContent"), json!("AddToCart")]);
        assert!(report.scripts.contains(&"//tracker.marinsm.com/tracker/async/m-1.js".to_string()));
    }

    #[tokio::test]
    async fn test_test_mode_query_enables_gated_plugin() {
        let dir = TempDir::new().unwrap();
        let mut args = setup(&dir, None).await;
        args.query = Some("?__odltest__=1".to_string());

        let report = Application::new(args).await.unwrap().run().await.unwrap();
        assert!(report.test_mode);
        assert!(report.plugins.contains(&"odl/plugins/ga".to_string()));
        assert!(report.cookies.contains("__odltest__"));
        let create = report
            .tracker_calls
            .iter()
            .find(|call| call.tracker == "ga" && call.command == "create")
            .unwrap();
        assert_eq!(create.args[0], json!("UA-PROD"));
    }

    #[tokio::test]
    async fn test_queued_commands_dispatch_after_ready() {
        let dir = TempDir::new().unwrap();
        let commands = r#"[
            ["isReady"],
            ["broadcast", "product-changevariant", {"product": {"ean": "5"}}],
            ["hasPlugin", "odl/plugins/facebookWCA"],
            ["reticulate"]
        ]"#;
        let app = Application::new(setup(&dir, Some(commands)).await).await.unwrap();
        let report = app.run().await.unwrap();

        assert_eq!(report.commands.len(), 4);
        assert_eq!(report.commands[0].result, Some(json!(true)));
        assert_eq!(report.commands[2].result, Some(json!(true)));
        assert!(report.commands[3].error.as_deref().unwrap().contains("reticulate"));

        let last = report.tracker_calls.iter().rev().find(|call| call.tracker == "_fbq").unwrap();
        assert_eq!(last.args[1]["content_ids"], json!(["5"]));
    }

    #[tokio::test]
    async fn test_invalid_page_data_fails_run() {
        let dir = TempDir::new().unwrap();
        let mut args = setup(&dir, None).await;
        let document = dir.path().join("empty.html");
        tokio::fs::write(&document, "<html><body></body></html>").await.unwrap();
        args.document = Some(document);

        let app = Application::new(args).await.unwrap();
        assert!(app.run().await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let mut args = setup(&dir, None).await;
        args.log_level = Some("loud".to_string());
        assert!(Application::new(args).await.is_err());
    }
}
