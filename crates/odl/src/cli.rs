//! Command-line interface for the data layer host.
//!
//! Built with the `clap` builder API. Every option overrides the matching
//! value from the configuration file.

use clap::{Arg, ArgMatches, Command};
use std::ffi::OsString;
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// HTML snapshot of the page to scan for `odl:` metadata
    pub document: Option<PathBuf>,
    /// Query string of the page URL
    pub query: Option<String>,
    /// `Cookie` header of the request
    pub cookies: Option<String>,
    /// JSON file with queued `[method, ...args]` commands
    pub commands: Option<PathBuf>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
}

fn command() -> Command {
    Command::new("odl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Runs the open data layer and its analytics plugins against a page snapshot")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("odl.toml"),
        )
        .arg(
            Arg::new("document")
                .short('d')
                .long("document")
                .value_name("FILE")
                .help("HTML document to collect metadata from"),
        )
        .arg(
            Arg::new("query")
                .short('q')
                .long("query")
                .value_name("QUERY")
                .help("Page query string (e.g. ?__odltest__=1)"),
        )
        .arg(
            Arg::new("cookies")
                .long("cookies")
                .value_name("HEADER")
                .help("Cookie header (e.g. \"bid=abc; __odltest__=1\")"),
        )
        .arg(
            Arg::new("commands")
                .long("commands")
                .value_name("FILE")
                .help("JSON array of queued commands to dispatch once ready"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(clap::ArgAction::SetTrue),
        )
}

impl CliArgs {
    /// Parses the process arguments, exiting with usage on error.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    /// Parses an explicit argument list, first item being the binary name.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Ok(Self::from_matches(&command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("odl.toml")),
            document: matches.get_one::<String>("document").map(PathBuf::from),
            query: matches.get_one::<String>("query").cloned(),
            cookies: matches.get_one::<String>("cookies").cloned(),
            commands: matches.get_one::<String>("commands").map(PathBuf::from),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = CliArgs::try_parse_from(["odl"]).unwrap();
        assert_eq!(args.config_path, PathBuf::from("odl.toml"));
        assert!(args.document.is_none());
        assert!(!args.json_logs);
    }

    #[test]
    fn test_overrides() {
        let args = CliArgs::try_parse_from([
            "odl",
            "--config",
            "site.toml",
            "--document",
            "page.html",
            "--query",
            "?__odltest__=1",
            "--cookies",
            "bid=42",
            "-l",
            "debug",
            "--json-logs",
        ])
        .unwrap();
        assert_eq!(args.config_path, PathBuf::from("site.toml"));
        assert_eq!(args.document, Some(PathBuf::from("page.html")));
        assert_eq!(args.query.as_deref(), Some("?__odltest__=1"));
        assert_eq!(args.cookies.as_deref(), Some("bid=42"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(CliArgs::try_parse_from(["odl", "--bind", "0.0.0.0:80"]).is_err());
    }
}
