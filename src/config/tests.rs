use std::path::Path;

use super::*;

#[test]
fn defaults_are_complete() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.listen, "127.0.0.1:8080".parse().expect("addr"));
    assert_eq!(settings.server.upstream.as_str(), "http://127.0.0.1:3000/");
    assert_eq!(settings.cache.root, Path::new(DEFAULT_CACHE_ROOT));
    assert_eq!(settings.cache.gzip_level, 9);
    assert_eq!(settings.cache.min_body_bytes, 255);
    assert!(settings.cache.enabled && settings.cache.gzip && settings.cache.serve_hits);
    assert!(!settings.minify.html);
    assert!(!settings.css.optimize);
    assert_eq!(settings.css.public_path, "/cache/presscache/css");
    assert_eq!(settings.css.fetch_timeout, Duration::from_secs(5));
    assert!(settings.gate.excluded_paths.iter().any(|p| p == "/checkout/"));
    assert!(!settings.gate.trust_forwarded);
    assert_eq!(settings.scripts.deferred, ["jquery-core", "jquery-migrate"]);
    assert!(settings.fallbacks.is_empty());
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.listen = Some("127.0.0.1:4000".to_string());
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        listen: Some("0.0.0.0:4321".to_string()),
        log_level: Some("debug".to_string()),
        cache: CacheRootOverride {
            cache_root: Some("/var/cache/site".into()),
        },
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.listen.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.cache.root, Path::new("/var/cache/site"));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn out_of_range_tunables_fall_back_to_defaults() {
    let mut raw = RawSettings::default();
    raw.cache.gzip_level = Some(12);
    raw.cache.min_body_bytes = Some(0);
    raw.css.fetch_timeout_seconds = Some(0);
    raw.server.graceful_shutdown_seconds = Some(0);
    raw.logging.level = Some("loud".to_string());

    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.cache.gzip_level, DEFAULT_GZIP_LEVEL);
    assert_eq!(settings.cache.min_body_bytes, DEFAULT_MIN_BODY_BYTES);
    assert_eq!(settings.css.fetch_timeout, Duration::from_secs(5));
    assert_eq!(settings.server.graceful_shutdown, Duration::from_secs(30));
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    let keys: Vec<_> = settings.fallbacks.iter().map(|f| f.key).collect();
    assert_eq!(
        keys,
        [
            "server.graceful_shutdown_seconds",
            "logging.level",
            "cache.gzip_level",
            "cache.min_body_bytes",
            "css.fetch_timeout_seconds"
        ]
    );
}

#[test]
fn structural_errors_are_reported() {
    let mut raw = RawSettings::default();
    raw.server.upstream = Some("ftp://origin".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "server.upstream",
            ..
        })
    ));

    let mut raw = RawSettings::default();
    raw.server.listen = Some("not-an-address".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "server.listen",
            ..
        })
    ));

    let mut raw = RawSettings::default();
    raw.css.public_path = Some("relative/css".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "css.public_path",
            ..
        })
    ));
}

#[test]
fn configured_lists_replace_defaults() {
    let mut raw = RawSettings::default();
    raw.gate.excluded_paths = Some(vec![" /basket/ ".to_string(), String::new()]);
    raw.css.excluded_patterns = Some(vec!["print".to_string()]);
    raw.css.public_path = Some("/static/css/".to_string());

    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.gate.excluded_paths, ["/basket/"]);
    assert_eq!(settings.css.optimizer_config().excluded_patterns, ["print"]);
    assert_eq!(settings.css.public_path, "/static/css");
}

#[test]
fn forwarded_headers_can_be_trusted() {
    let mut raw = RawSettings::default();
    raw.gate.trust_forwarded = Some(true);

    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(settings.gate.trust_forwarded);
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["presscache"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "presscache",
        "serve",
        "--listen",
        "0.0.0.0:80",
        "--upstream",
        "http://origin:8000",
        "--cache-root",
        "/tmp/pc",
        "--log-json",
        "yes",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.listen.as_deref(), Some("0.0.0.0:80"));
            assert_eq!(
                serve.overrides.upstream.as_deref(),
                Some("http://origin:8000")
            );
            assert_eq!(
                serve.overrides.cache.cache_root.as_deref(),
                Some(Path::new("/tmp/pc"))
            );
            assert_eq!(serve.overrides.log_json, Some(true));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_purge_arguments() {
    let args = CliArgs::parse_from([
        "presscache",
        "purge",
        "--url",
        "https://example.com/hello/",
        "--cache-root",
        "/tmp/pc",
    ]);

    match args.command.expect("purge command") {
        Command::Purge(purge) => {
            assert_eq!(
                purge.url.as_ref().map(Url::as_str),
                Some("https://example.com/hello/")
            );
            assert!(!purge.stylesheets);

            let mut raw = RawSettings::default();
            raw.apply_cache_root_override(&purge.cache);
            let settings = Settings::from_raw(raw).expect("valid settings");
            assert_eq!(settings.cache.root, Path::new("/tmp/pc"));
        }
        _ => panic!("wrong command parsed"),
    }
}
