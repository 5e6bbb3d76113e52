//! Page cache middleware.
//!
//! Serves stored artifacts for cacheable requests and runs the capture
//! pipeline over cacheable misses.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use metrics::counter;
use tracing::{debug, instrument, warn};

use super::{
    gate::{self, GateDecision, GateRules, RequestFacts},
    keys::CacheKey,
    pipeline::{PageContext, Pipeline},
    store::{ArtifactKind, ArtifactStore},
};

const SOURCE: &str = "presscache::cache::middleware";
const METRIC_GATE_BYPASS_TOTAL: &str = "presscache_gate_bypass_total";
const METRIC_ARTIFACT_HIT_TOTAL: &str = "presscache_artifact_hit_total";
const METRIC_ARTIFACT_MISS_TOTAL: &str = "presscache_artifact_miss_total";

/// Response header reporting how the cache handled a request.
pub const CACHE_STATUS_HEADER: &str = "x-presscache";
/// Largest body the middleware will buffer for capture.
pub const MAX_CAPTURE_BYTES: usize = 16 * 1024 * 1024;

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub rules: Arc<GateRules>,
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<ArtifactStore>,
}

impl CacheState {
    pub fn new(rules: GateRules, pipeline: Arc<Pipeline>, store: Arc<ArtifactStore>) -> Self {
        Self {
            rules: Arc::new(rules),
            pipeline,
            store,
        }
    }
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let config = cache.pipeline.config();
    if !config.enabled {
        return next.run(request).await;
    }

    let facts = RequestFacts::from_parts(
        request.method(),
        request.uri(),
        request.headers(),
        &cache.rules,
    );
    if let GateDecision::Bypass(reason) = gate::evaluate(&facts, &cache.rules) {
        counter!(METRIC_GATE_BYPASS_TOTAL, "reason" => reason.as_str()).increment(1);
        debug!(target = SOURCE, reason = reason.as_str(), "request bypasses cache");
        return next.run(request).await;
    }

    let Some(url) = facts.canonical_url() else {
        debug!(target = SOURCE, "no host to derive a cache key from");
        return next.run(request).await;
    };
    let key = CacheKey::for_url(&url);

    if config.serve_hits {
        let gzip = accepts_gzip(request.headers());
        if let Some(response) = serve_stored(&cache.store, &key, gzip).await {
            counter!(METRIC_ARTIFACT_HIT_TOTAL).increment(1);
            debug!(target = SOURCE, outcome = "hit", key = %key, gzip, "serving stored page");
            return response;
        }
    }

    counter!(METRIC_ARTIFACT_MISS_TOTAL).increment(1);
    debug!(target = SOURCE, outcome = "miss", key = %key, "rendering page");

    let response = next.run(request).await;
    if !is_capturable(&response) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match buffer_body(body, MAX_CAPTURE_BYTES).await {
        Ok(Buffered::Complete(bytes)) => bytes,
        Ok(Buffered::Overflow(body)) => {
            warn!(
                target = SOURCE,
                limit = MAX_CAPTURE_BYTES,
                "response exceeds capture limit; relayed without caching"
            );
            return Response::from_parts(parts, body);
        }
        Err(err) => {
            warn!(target = SOURCE, error = %err, "failed to buffer response body");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let html = match String::from_utf8(bytes.to_vec()) {
        Ok(html) => html,
        Err(_) => {
            debug!(target = SOURCE, "response body is not UTF-8; not captured");
            return Response::from_parts(parts, Body::from(bytes));
        }
    };

    let page = PageContext::new(url, facts.secure);
    let processed = cache.pipeline.process(&page, html).await;

    parts.headers.remove(header::CONTENT_LENGTH);
    parts
        .headers
        .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("miss"));
    Response::from_parts(parts, Body::from(processed.body))
}

enum Buffered {
    Complete(Bytes),
    /// Limit exceeded; the buffered prefix followed by the unread remainder.
    Overflow(Body),
}

async fn buffer_body(body: Body, limit: usize) -> Result<Buffered, axum::Error> {
    let mut rest = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut total = 0usize;
    while let Some(chunk) = rest.next().await {
        let chunk = chunk?;
        total += chunk.len();
        chunks.push(chunk);
        if total > limit {
            let prefix = stream::iter(chunks.into_iter().map(Ok::<_, axum::Error>));
            return Ok(Buffered::Overflow(Body::from_stream(prefix.chain(rest))));
        }
    }

    let mut buf = BytesMut::with_capacity(total);
    for chunk in chunks {
        buf.extend_from_slice(&chunk);
    }
    Ok(Buffered::Complete(buf.freeze()))
}

/// Only complete, uncompressed HTML documents are captured.
fn is_capturable(response: &Response) -> bool {
    if response.status() != StatusCode::OK {
        return false;
    }
    let headers = response.headers();
    if headers.contains_key(header::CONTENT_ENCODING) {
        return false;
    }
    if headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .is_some_and(|len| len > MAX_CAPTURE_BYTES)
    {
        return false;
    }
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            v.split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/html"))
        })
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|coding| {
            let mut params = coding.split(';').map(str::trim);
            let name = params.next().unwrap_or_default();
            let refused = params.any(|p| {
                p.strip_prefix("q=")
                    .and_then(|q| q.parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            });
            (name.eq_ignore_ascii_case("gzip") || name == "*") && !refused
        })
}

async fn serve_stored(store: &Arc<ArtifactStore>, key: &CacheKey, gzip: bool) -> Option<Response> {
    let store = Arc::clone(store);
    let key = key.clone();
    let lookup = tokio::task::spawn_blocking(move || -> Option<(Bytes, bool)> {
        if gzip && let Some(bytes) = read_quietly(&store, &key, ArtifactKind::Gzip) {
            return Some((bytes, true));
        }
        read_quietly(&store, &key, ArtifactKind::Html).map(|bytes| (bytes, false))
    });

    let (bytes, compressed) = lookup.await.ok().flatten()?;
    Some(build_response(bytes, compressed))
}

fn read_quietly(store: &ArtifactStore, key: &CacheKey, kind: ArtifactKind) -> Option<Bytes> {
    store.read(key, kind).unwrap_or_else(|err| {
        warn!(target = SOURCE, error = %err, "failed to read stored artifact");
        None
    })
}

fn build_response(bytes: Bytes, compressed: bool) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, HTML_CONTENT_TYPE)
        .header(header::VARY, "Accept-Encoding")
        .header(CACHE_STATUS_HEADER, "hit");
    if compressed {
        builder = builder.header(header::CONTENT_ENCODING, "gzip");
    }

    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(accept: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(header::ACCEPT_ENCODING, HeaderValue::from_str(accept).expect("header"));
        map
    }

    #[test]
    fn accept_encoding_detection() {
        assert!(accepts_gzip(&headers("gzip, deflate, br")));
        assert!(accepts_gzip(&headers("br;q=1.0, gzip;q=0.8")));
        assert!(!accepts_gzip(&headers("gzip;q=0, br")));
        assert!(!accepts_gzip(&headers("identity")));
        assert!(!accepts_gzip(&HeaderMap::new()));
    }

    fn chunked(parts: &[&'static str]) -> Body {
        let chunks: Vec<Result<Bytes, axum::Error>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect();
        Body::from_stream(stream::iter(chunks))
    }

    #[tokio::test]
    async fn bodies_within_the_limit_are_buffered_whole() {
        match buffer_body(chunked(&["<p>", "hi", "</p>"]), 16).await {
            Ok(Buffered::Complete(bytes)) => assert_eq!(&bytes[..], b"<p>hi</p>"),
            _ => panic!("expected a complete body"),
        }
    }

    #[tokio::test]
    async fn oversized_bodies_are_relayed_intact() {
        let body = match buffer_body(chunked(&["aaaa", "bbbb", "cccc", "dd"]), 6).await {
            Ok(Buffered::Overflow(body)) => body,
            _ => panic!("expected the limit to be exceeded"),
        };
        let relayed = axum::body::to_bytes(body, usize::MAX).await.expect("body");
        assert_eq!(&relayed[..], b"aaaabbbbccccdd");
    }

    #[test]
    fn only_plain_html_ok_responses_are_capturable() {
        let html = Response::builder()
            .header(header::CONTENT_TYPE, "text/html; charset=UTF-8")
            .body(Body::empty())
            .expect("response");
        assert!(is_capturable(&html));

        let json = Response::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::empty())
            .expect("response");
        assert!(!is_capturable(&json));

        let encoded = Response::builder()
            .header(header::CONTENT_TYPE, "text/html")
            .header(header::CONTENT_ENCODING, "br")
            .body(Body::empty())
            .expect("response");
        assert!(!is_capturable(&encoded));

        let missing = Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(header::CONTENT_TYPE, "text/html")
            .body(Body::empty())
            .expect("response");
        assert!(!is_capturable(&missing));
    }
}
