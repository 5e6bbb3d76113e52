//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::{
    cache::{DEFAULT_GZIP_LEVEL, DEFAULT_MIN_BODY_BYTES, GateRules},
    transform::{CssConfig, MinifyOptions, ScriptLoading, css::DEFAULT_PUBLIC_PATH},
};

mod cli;

pub use cli::{CacheRootOverride, CliArgs, Command, PurgeArgs, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "presscache";
const ENV_PREFIX: &str = "PRESSCACHE";
const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
const DEFAULT_UPSTREAM: &str = "http://127.0.0.1:3000";
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 60;
const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::INFO;
const DEFAULT_CACHE_ROOT: &str = "cache/presscache";
const MAX_GZIP_LEVEL: u32 = 9;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 5;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub gate: GateRules,
    pub minify: MinifySettings,
    pub css: CssSettings,
    pub scripts: ScriptLoading,
    /// Out-of-range values that were replaced by their defaults.
    pub fallbacks: Vec<Fallback>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: SocketAddr,
    pub upstream: Url,
    pub upstream_timeout: Duration,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub root: PathBuf,
    pub enabled: bool,
    pub gzip: bool,
    pub gzip_level: u32,
    pub min_body_bytes: usize,
    pub serve_hits: bool,
}

#[derive(Debug, Clone)]
pub struct MinifySettings {
    pub html: bool,
    pub options: MinifyOptions,
}

#[derive(Debug, Clone)]
pub struct CssSettings {
    pub optimize: bool,
    pub minify: bool,
    pub process_external: bool,
    pub excluded_patterns: Vec<String>,
    pub fetch_timeout: Duration,
    pub public_path: String,
    /// Local directory that mirrors the site's public files.
    pub document_root: Option<PathBuf>,
}

impl CssSettings {
    pub fn optimizer_config(&self) -> CssConfig {
        CssConfig {
            minify: self.minify,
            process_external: self.process_external,
            excluded_patterns: self.excluded_patterns.clone(),
            public_path: self.public_path.clone(),
        }
    }
}

/// A configured value that was out of range and replaced by its default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fallback {
    pub key: &'static str,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Purge(args)) => raw.apply_cache_root_override(&args.cache),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    gate: RawGateSettings,
    minify: RawMinifySettings,
    css: RawCssSettings,
    scripts: RawScriptSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(listen) = overrides.listen.as_ref() {
            self.server.listen = Some(listen.clone());
        }
        if let Some(upstream) = overrides.upstream.as_ref() {
            self.server.upstream = Some(upstream.clone());
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }

        self.apply_cache_root_override(&overrides.cache);
    }

    fn apply_cache_root_override(&mut self, overrides: &CacheRootOverride) {
        if let Some(root) = overrides.cache_root.as_ref() {
            self.cache.root = Some(root.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            gate,
            minify,
            css,
            scripts,
        } = raw;

        let mut fallbacks = Vec::new();
        let server = build_server_settings(server, &mut fallbacks)?;
        let logging = build_logging_settings(logging, &mut fallbacks);
        let cache = build_cache_settings(cache, &mut fallbacks)?;
        let gate = build_gate_rules(gate);
        let minify = build_minify_settings(minify);
        let css = build_css_settings(css, &mut fallbacks)?;
        let scripts = build_script_loading(scripts);

        Ok(Self {
            server,
            logging,
            cache,
            gate,
            minify,
            css,
            scripts,
            fallbacks,
        })
    }
}

fn build_server_settings(
    server: RawServerSettings,
    fallbacks: &mut Vec<Fallback>,
) -> Result<ServerSettings, LoadError> {
    let listen = server.listen.unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let listen = SocketAddr::from_str(listen.trim())
        .map_err(|err| LoadError::invalid("server.listen", format!("{listen}: {err}")))?;

    let upstream = server
        .upstream
        .unwrap_or_else(|| DEFAULT_UPSTREAM.to_string());
    let upstream = Url::parse(upstream.trim())
        .map_err(|err| LoadError::invalid("server.upstream", format!("{upstream}: {err}")))?;
    if !matches!(upstream.scheme(), "http" | "https") || upstream.host_str().is_none() {
        return Err(LoadError::invalid(
            "server.upstream",
            "must be an absolute http(s) URL",
        ));
    }

    let upstream_timeout_secs = match server.upstream_timeout_seconds {
        Some(0) => {
            fallbacks.push(Fallback {
                key: "server.upstream_timeout_seconds",
                reason: format!("must be greater than zero; using {DEFAULT_UPSTREAM_TIMEOUT_SECS}"),
            });
            DEFAULT_UPSTREAM_TIMEOUT_SECS
        }
        Some(secs) => secs,
        None => DEFAULT_UPSTREAM_TIMEOUT_SECS,
    };

    let graceful_secs = match server.graceful_shutdown_seconds {
        Some(0) => {
            fallbacks.push(Fallback {
                key: "server.graceful_shutdown_seconds",
                reason: format!("must be greater than zero; using {DEFAULT_GRACEFUL_SHUTDOWN_SECS}"),
            });
            DEFAULT_GRACEFUL_SHUTDOWN_SECS
        }
        Some(secs) => secs,
        None => DEFAULT_GRACEFUL_SHUTDOWN_SECS,
    };

    Ok(ServerSettings {
        listen,
        upstream,
        upstream_timeout: Duration::from_secs(upstream_timeout_secs),
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(
    logging: RawLoggingSettings,
    fallbacks: &mut Vec<Fallback>,
) -> LoggingSettings {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.trim()).unwrap_or_else(|err| {
            fallbacks.push(Fallback {
                key: "logging.level",
                reason: format!("`{level}` is not a log level ({err}); using {DEFAULT_LOG_LEVEL}"),
            });
            DEFAULT_LOG_LEVEL
        }),
        None => DEFAULT_LOG_LEVEL,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    LoggingSettings { level, format }
}

fn build_cache_settings(
    cache: RawCacheSettings,
    fallbacks: &mut Vec<Fallback>,
) -> Result<CacheSettings, LoadError> {
    let root = cache
        .root
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_ROOT));
    if root.as_os_str().is_empty() {
        return Err(LoadError::invalid("cache.root", "path must not be empty"));
    }

    let gzip_level = match cache.gzip_level {
        Some(level) if level > MAX_GZIP_LEVEL => {
            fallbacks.push(Fallback {
                key: "cache.gzip_level",
                reason: format!("{level} is outside 0..={MAX_GZIP_LEVEL}; using {DEFAULT_GZIP_LEVEL}"),
            });
            DEFAULT_GZIP_LEVEL
        }
        Some(level) => level,
        None => DEFAULT_GZIP_LEVEL,
    };

    let min_body_bytes = match cache.min_body_bytes {
        Some(0) => {
            fallbacks.push(Fallback {
                key: "cache.min_body_bytes",
                reason: format!("must be greater than zero; using {DEFAULT_MIN_BODY_BYTES}"),
            });
            DEFAULT_MIN_BODY_BYTES
        }
        Some(bytes) => bytes,
        None => DEFAULT_MIN_BODY_BYTES,
    };

    Ok(CacheSettings {
        root,
        enabled: cache.enabled.unwrap_or(true),
        gzip: cache.gzip.unwrap_or(true),
        gzip_level,
        min_body_bytes,
        serve_hits: cache.serve_hits.unwrap_or(true),
    })
}

fn build_gate_rules(gate: RawGateSettings) -> GateRules {
    let defaults = GateRules::default();
    GateRules {
        excluded_paths: non_empty_entries(gate.excluded_paths).unwrap_or(defaults.excluded_paths),
        session_cookie_prefixes: non_empty_entries(gate.session_cookie_prefixes)
            .unwrap_or(defaults.session_cookie_prefixes),
        admin_path_prefixes: non_empty_entries(gate.admin_path_prefixes)
            .unwrap_or(defaults.admin_path_prefixes),
        trust_forwarded: gate.trust_forwarded.unwrap_or(defaults.trust_forwarded),
    }
}

fn build_minify_settings(minify: RawMinifySettings) -> MinifySettings {
    let defaults = MinifyOptions::default();
    MinifySettings {
        html: minify.html.unwrap_or(false),
        options: MinifyOptions {
            remove_comments: minify.remove_comments.unwrap_or(defaults.remove_comments),
            remove_whitespace: minify.remove_whitespace.unwrap_or(defaults.remove_whitespace),
            remove_blank_lines: minify
                .remove_blank_lines
                .unwrap_or(defaults.remove_blank_lines),
            compress_js: minify.compress_js.unwrap_or(defaults.compress_js),
            compress_css: minify.compress_css.unwrap_or(defaults.compress_css),
        },
    }
}

fn build_css_settings(
    css: RawCssSettings,
    fallbacks: &mut Vec<Fallback>,
) -> Result<CssSettings, LoadError> {
    let fetch_timeout_secs = match css.fetch_timeout_seconds {
        Some(0) => {
            fallbacks.push(Fallback {
                key: "css.fetch_timeout_seconds",
                reason: format!("must be greater than zero; using {DEFAULT_FETCH_TIMEOUT_SECS}"),
            });
            DEFAULT_FETCH_TIMEOUT_SECS
        }
        Some(secs) => secs,
        None => DEFAULT_FETCH_TIMEOUT_SECS,
    };

    let public_path = css
        .public_path
        .unwrap_or_else(|| DEFAULT_PUBLIC_PATH.to_string());
    let public_path = public_path.trim().trim_end_matches('/').to_string();
    if !public_path.starts_with('/') {
        return Err(LoadError::invalid(
            "css.public_path",
            "must be an absolute URL path",
        ));
    }

    let document_root = css
        .document_root
        .filter(|path| !path.as_os_str().is_empty());

    Ok(CssSettings {
        optimize: css.optimize.unwrap_or(false),
        minify: css.minify.unwrap_or(true),
        process_external: css.process_external.unwrap_or(false),
        excluded_patterns: non_empty_entries(css.excluded_patterns).unwrap_or_default(),
        fetch_timeout: Duration::from_secs(fetch_timeout_secs),
        public_path,
        document_root,
    })
}

fn build_script_loading(scripts: RawScriptSettings) -> ScriptLoading {
    let defaults = ScriptLoading::default();
    ScriptLoading {
        defer: scripts.defer.unwrap_or(defaults.defer),
        delay: scripts.delay.unwrap_or(defaults.delay),
        excluded: non_empty_entries(scripts.excluded).unwrap_or(defaults.excluded),
        deferred: non_empty_entries(scripts.deferred).unwrap_or(defaults.deferred),
    }
}

/// Trim list entries and drop blanks; `None` when the list was not configured.
fn non_empty_entries(values: Option<Vec<String>>) -> Option<Vec<String>> {
    values.map(|values| {
        values
            .into_iter()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect()
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    listen: Option<String>,
    upstream: Option<String>,
    upstream_timeout_seconds: Option<u64>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    root: Option<PathBuf>,
    enabled: Option<bool>,
    gzip: Option<bool>,
    gzip_level: Option<u32>,
    min_body_bytes: Option<usize>,
    serve_hits: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawGateSettings {
    excluded_paths: Option<Vec<String>>,
    session_cookie_prefixes: Option<Vec<String>>,
    admin_path_prefixes: Option<Vec<String>>,
    trust_forwarded: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMinifySettings {
    html: Option<bool>,
    remove_comments: Option<bool>,
    remove_whitespace: Option<bool>,
    remove_blank_lines: Option<bool>,
    compress_js: Option<bool>,
    compress_css: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCssSettings {
    optimize: Option<bool>,
    minify: Option<bool>,
    process_external: Option<bool>,
    excluded_patterns: Option<Vec<String>>,
    fetch_timeout_seconds: Option<u64>,
    public_path: Option<String>,
    document_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawScriptSettings {
    defer: Option<bool>,
    delay: Option<bool>,
    excluded: Option<Vec<String>>,
    deferred: Option<Vec<String>>,
}

#[cfg(test)]
mod tests;
