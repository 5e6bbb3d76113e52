//! Request forwarding to the rendering origin.

use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use reqwest::{Client, redirect::Policy};
use tracing::warn;
use url::Url;

use crate::cache::gate::{FORWARDED_HOST, FORWARDED_PROTO};

const SOURCE: &str = "presscache::infra::http::proxy";
/// Largest request body forwarded upstream.
pub const MAX_FORWARD_BODY_BYTES: usize = 32 * 1024 * 1024;

const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Clone)]
pub struct Upstream {
    client: Client,
    base: Url,
    trust_forwarded: bool,
}

impl Upstream {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("presscache/", env!("CARGO_PKG_VERSION")))
            .redirect(Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base,
            trust_forwarded: false,
        })
    }

    /// Pass inbound `X-Forwarded-*` headers through instead of rebuilding them.
    pub fn trust_forwarded(mut self, trust: bool) -> Self {
        self.trust_forwarded = trust;
        self
    }

    /// Absolute upstream URL for an inbound request URI.
    pub fn target(&self, uri: &Uri) -> Url {
        let mut target = self.base.clone();
        let prefix = self.base.path().trim_end_matches('/');
        target.set_path(&format!("{prefix}{}", uri.path()));
        target.set_query(uri.query());
        target
    }
}

/// Fallback handler: forward the request upstream and relay the answer.
pub async fn forward(State(upstream): State<Upstream>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let target = upstream.target(&parts.uri);

    let body = match axum::body::to_bytes(body, MAX_FORWARD_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(target = SOURCE, error = %err, "failed to read request body");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let headers = upstream_headers(&parts.headers, &parts.uri, upstream.trust_forwarded);
    let result = upstream
        .client
        .request(parts.method.clone(), target.clone())
        .headers(headers)
        .body(body)
        .send()
        .await;

    let response = match result {
        Ok(response) => response,
        Err(err) => {
            warn!(
                target = SOURCE,
                method = %parts.method,
                url = %target,
                error = %err,
                "upstream request failed"
            );
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let status = response.status();
    let mut headers = response.headers().clone();
    strip_hop_by_hop(&mut headers);

    match response.bytes().await {
        Ok(bytes) => {
            let mut relayed = Response::new(Body::from(bytes));
            *relayed.status_mut() = status;
            *relayed.headers_mut() = headers;
            relayed
        }
        Err(err) => {
            warn!(target = SOURCE, url = %target, error = %err, "failed to read upstream body");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// Inbound headers as sent upstream: no hop-by-hop headers, identity
/// encoding so captured bodies are plain text, and the original host kept
/// in `X-Forwarded-Host`. Untrusted `X-Forwarded-*` values are replaced.
fn upstream_headers(inbound: &HeaderMap, uri: &Uri, trust_forwarded: bool) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::ACCEPT_ENCODING);
    headers.remove(header::CONTENT_LENGTH);
    if !trust_forwarded {
        headers.remove(FORWARDED_HOST);
        headers.remove(FORWARDED_PROTO);
    }

    if let Some(host) = headers.remove(header::HOST)
        && !headers.contains_key(FORWARDED_HOST)
    {
        headers.insert(FORWARDED_HOST, host);
    }
    if !headers.contains_key(FORWARDED_PROTO) {
        let proto = if uri.scheme_str() == Some("https") {
            "https"
        } else {
            "http"
        };
        headers.insert(FORWARDED_PROTO, HeaderValue::from_static(proto));
    }
    headers
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}
