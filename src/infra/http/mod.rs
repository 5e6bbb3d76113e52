//! HTTP surface: the caching reverse proxy and the consolidated stylesheet route.

mod middleware;
pub mod proxy;
mod public;

use std::{future::IntoFuture, sync::Arc, time::Duration};

use axum::{Router, middleware as axum_middleware, routing::get};
use tokio::{net::TcpListener, sync::oneshot};
use tracing::{info, warn};

pub use middleware::log_responses;
pub use proxy::Upstream;
pub use public::serve_stylesheet;

use crate::cache::{ArtifactStore, CacheState, response_cache_layer};

use super::error::InfraError;

/// Assemble the public router.
///
/// Everything except the stylesheet route is forwarded upstream through the
/// page cache middleware.
pub fn build_router(
    cache: CacheState,
    upstream: Upstream,
    store: Arc<ArtifactStore>,
    stylesheet_path: &str,
) -> Router {
    let stylesheets = Router::new()
        .route(
            &format!("{}/{{file}}", stylesheet_path.trim_end_matches('/')),
            get(serve_stylesheet),
        )
        .with_state(store);

    let proxied = Router::new()
        .fallback(proxy::forward)
        .with_state(upstream)
        .layer(axum_middleware::from_fn_with_state(cache, response_cache_layer));

    stylesheets
        .merge(proxied)
        .layer(axum_middleware::from_fn(log_responses))
}

/// Serve `router` until Ctrl-C, then give in-flight requests `grace` to finish.
pub async fn serve(listener: TcpListener, router: Router, grace: Duration) -> Result<(), InfraError> {
    let (signalled_tx, signalled_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            wait_for_ctrl_c().await;
            let _ = signalled_tx.send(());
        })
        .into_future();

    let deadline = async move {
        if signalled_rx.await.is_ok() {
            tokio::time::sleep(grace).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = server => result.map_err(InfraError::from),
        () = deadline => {
            warn!(
                target = "presscache::infra::http",
                grace_seconds = grace.as_secs(),
                "graceful shutdown timed out; dropping open connections"
            );
            Ok(())
        }
    }
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(target = "presscache::infra::http", "shutdown signal received"),
        Err(err) => {
            warn!(
                target = "presscache::infra::http",
                error = %err,
                "failed to listen for shutdown signal"
            );
            std::future::pending::<()>().await;
        }
    }
}
