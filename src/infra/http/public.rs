use std::{io::ErrorKind, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{
        StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::cache::ArtifactStore;

const SOURCE: &str = "presscache::infra::http::public::serve_stylesheet";

/// Serve a consolidated stylesheet. Names are content fingerprints, so the
/// response may be cached forever.
pub async fn serve_stylesheet(
    State(store): State<Arc<ArtifactStore>>,
    Path(file): Path<String>,
) -> Response {
    let Some(path) = store.stylesheet_path(&file) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [
                (CONTENT_TYPE, "text/css; charset=utf-8"),
                (CACHE_CONTROL, "public, max-age=31536000, immutable"),
            ],
            bytes,
        )
            .into_response(),
        Err(err) if err.kind() == ErrorKind::NotFound => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!(
                target = SOURCE,
                path = %path.display(),
                error = %err,
                "failed to read stylesheet"
            );
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
