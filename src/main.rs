use std::{process, sync::Arc};

use presscache::{
    application::{AppContext, AppError},
    cache::NoPermalinks,
    config::{self, PurgeArgs, Settings},
    infra::{
        error::InfraError,
        http::{self, Upstream},
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;
    for fallback in &settings.fallbacks {
        warn!(
            target = "presscache::config",
            key = fallback.key,
            reason = %fallback.reason,
            "configuration value out of range; default used"
        );
    }

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Purge(args) => run_purge(settings, args),
    }
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    let app = AppContext::build(&settings, Arc::new(NoPermalinks))?;

    let upstream = Upstream::new(
        settings.server.upstream.clone(),
        settings.server.upstream_timeout,
    )
    .map_err(InfraError::from)?
    .trust_forwarded(settings.gate.trust_forwarded);
    let router = http::build_router(
        app.cache_state(),
        upstream,
        Arc::clone(&app.store),
        &settings.css.public_path,
    );

    let listener = tokio::net::TcpListener::bind(settings.server.listen)
        .await
        .map_err(InfraError::from)?;
    info!(
        target = "presscache::serve",
        listen = %settings.server.listen,
        upstream = %settings.server.upstream,
        cache_root = %app.store.root().display(),
        "presscache listening"
    );

    http::serve(listener, router, settings.server.graceful_shutdown).await?;
    info!(target = "presscache::serve", "server stopped");
    Ok(())
}

fn run_purge(settings: Settings, args: PurgeArgs) -> Result<(), AppError> {
    let app = AppContext::build(&settings, Arc::new(NoPermalinks))?;

    let cleared = match args.url.as_ref() {
        Some(url) => app.invalidator.clear_url(url)?,
        None => app.invalidator.clear_all()?,
    };
    let stylesheets = if args.stylesheets {
        app.invalidator.purge_stylesheets()?.files
    } else {
        0
    };

    info!(
        target = "presscache::purge",
        url = args.url.as_ref().map(|u| u.as_str()).unwrap_or("*"),
        pages = cleared.files,
        stylesheets,
        "purge complete"
    );
    Ok(())
}
