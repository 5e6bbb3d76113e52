use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use url::Url;

/// Command-line arguments for the presscache binary.
#[derive(Debug, Parser)]
#[command(
    name = "presscache",
    version,
    about = "Full-page cache and optimizing reverse proxy"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "PRESSCACHE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching proxy in front of the upstream origin.
    Serve(Box<ServeArgs>),
    /// Remove cached pages: one URL, or everything.
    Purge(PurgeArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheRootOverride {
    /// Override the cache root directory.
    #[arg(long = "cache-root", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub cache_root: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub cache: CacheRootOverride,

    /// Override the listen address (host:port).
    #[arg(long = "listen", value_name = "ADDR")]
    pub listen: Option<String>,

    /// Override the upstream origin URL.
    #[arg(long = "upstream", value_name = "URL")]
    pub upstream: Option<String>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub cache: CacheRootOverride,

    /// Purge only the page at this URL.
    #[arg(long = "url", value_name = "URL")]
    pub url: Option<Url>,

    /// Also remove consolidated stylesheets.
    #[arg(long = "stylesheets", action = clap::ArgAction::SetTrue)]
    pub stylesheets: bool,
}
