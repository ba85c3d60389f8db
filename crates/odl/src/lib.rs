//! # odl - open data layer host
//!
//! Runs the data layer and the bundled analytics plugins against a page
//! snapshot (an HTML document, query string and cookie header) and prints a
//! JSON report of the resulting global data, plugin state and the tracker
//! commands each vendor would have received.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration (odl.toml is created when missing)
//! odl
//!
//! # Scan a saved page in test mode
//! odl --document page.html --query "?__odltest__=1"
//!
//! # Replay queued commands once the layer is ready
//! odl --commands queue.json --log-level debug
//! ```

use tracing::error;

mod app;
mod cli;
mod config;
mod logging;

pub use app::{Application, CommandOutcome, Report};
pub use cli::CliArgs;
pub use config::{AppConfig, LoggingSettings, PageSettings, PluginSettings};

/// Entry point used by the `odl` binary.
///
/// Exits with status 1 when configuration, initialization or the run fails.
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Logging settings come from the file, so load it once up front
    let mut logging = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default()
        .logging;
    if let Some(level) = &args.log_level {
        logging.level = level.clone();
    }

    if let Err(e) = logging::setup_logging(&logging, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    match Application::new(args).await {
        Ok(app) => match app.run().await {
            Ok(report) => {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Err(e) => {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }

    Ok(())
}
