//! Capture & transform pipeline.
//!
//! Takes a fully rendered page, rewrites it in a fixed order (protocol fix,
//! script loading, stylesheet consolidation, minification) and persists the
//! result as a plain and a gzip artifact. Every failure degrades to passing
//! the previous stage's output through; the caller always gets a body back.

use std::{io::Write, sync::Arc, time::Instant};

use flate2::{Compression, write::GzEncoder};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use super::{
    config::CacheConfig,
    keys::{CacheKey, CanonicalUrl},
    store::{ArtifactKind, ArtifactStore, StoreError},
};
use crate::transform::{CssOptimizer, ScriptLoading, minify, protocol};

const SOURCE: &str = "presscache::cache::pipeline";
const METRIC_ARTIFACT_WRITE_TOTAL: &str = "presscache_artifact_write_total";
const METRIC_TRANSFORM_FAILED_TOTAL: &str = "presscache_transform_failed_total";
const METRIC_PIPELINE_MS: &str = "presscache_pipeline_ms";

/// The request a captured body belongs to.
#[derive(Debug, Clone)]
pub struct PageContext {
    pub url: CanonicalUrl,
    /// Served over a secure transport.
    pub secure: bool,
}

impl PageContext {
    pub fn new(url: CanonicalUrl, secure: bool) -> Self {
        Self { url, secure }
    }

    /// `host[:port]` as it appears in absolute same-host references.
    fn authority(&self) -> Option<String> {
        let url = self.url.as_url();
        let host = url.host_str()?;
        Some(match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }
}

/// Which artifacts a pipeline run persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Persisted {
    pub html: bool,
    pub gzip: bool,
}

/// Result of one pipeline run.
#[derive(Debug, Clone)]
pub struct Processed {
    pub body: String,
    pub persisted: Persisted,
}

pub struct Pipeline {
    config: CacheConfig,
    store: Arc<ArtifactStore>,
    css: Option<CssOptimizer>,
    scripts: ScriptLoading,
}

impl Pipeline {
    pub fn new(
        config: CacheConfig,
        store: Arc<ArtifactStore>,
        css: Option<CssOptimizer>,
        scripts: ScriptLoading,
    ) -> Self {
        Self {
            config,
            store,
            css,
            scripts,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Transform `body` and persist it under the page's key.
    pub async fn process(&self, page: &PageContext, body: String) -> Processed {
        if !self.config.enabled || body.len() < self.config.min_body_bytes {
            debug!(
                target = SOURCE,
                url = %page.url,
                bytes = body.len(),
                "body not captured; passing through"
            );
            return Processed {
                body,
                persisted: Persisted::default(),
            };
        }

        let started_at = Instant::now();
        let body = self.transform(page, body).await;
        let key = CacheKey::for_url(&page.url);
        let persisted = self.persist(&key, &body).await;

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_PIPELINE_MS).record(elapsed_ms);
        debug!(
            target = SOURCE,
            url = %page.url,
            key = %key,
            html = persisted.html,
            gzip = persisted.gzip,
            elapsed_ms,
            "pipeline finished"
        );

        Processed { body, persisted }
    }

    async fn transform(&self, page: &PageContext, mut body: String) -> String {
        if page.secure
            && let Some(authority) = page.authority()
        {
            body = protocol::normalize(&body, &authority);
        }

        if self.scripts.is_active() {
            match self.scripts.rewrite(&body) {
                Ok(rewritten) => body = rewritten,
                Err(err) => stage_failed("scripts", page, &err),
            }
        }

        if let Some(css) = &self.css {
            match css.optimize(&body, page.url.as_url()).await {
                Ok(Some(rewritten)) => body = rewritten,
                Ok(None) => {}
                Err(err) => stage_failed("css", page, &err),
            }
        }

        if self.config.minify_html {
            match minify(&body, &self.config.minify) {
                Ok(minified) => body = minified,
                Err(err) => stage_failed("minify", page, &err),
            }
        }

        body
    }

    async fn persist(&self, key: &CacheKey, body: &str) -> Persisted {
        let store = Arc::clone(&self.store);
        let key = key.clone();
        let bytes = body.as_bytes().to_vec();
        let gzip_level = self.config.gzip.then_some(self.config.gzip_level);

        let task = tokio::task::spawn_blocking(move || write_artifacts(&store, &key, &bytes, gzip_level));
        match task.await {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!(
                    target = SOURCE,
                    op = "persist",
                    error = %err,
                    "artifact write task failed"
                );
                Persisted::default()
            }
        }
    }
}

fn stage_failed(stage: &'static str, page: &PageContext, err: &dyn std::error::Error) {
    counter!(METRIC_TRANSFORM_FAILED_TOTAL, "stage" => stage).increment(1);
    warn!(
        target = SOURCE,
        stage,
        url = %page.url,
        error = %err,
        "transform stage failed; keeping previous output"
    );
}

fn write_artifacts(
    store: &ArtifactStore,
    key: &CacheKey,
    bytes: &[u8],
    gzip_level: Option<u32>,
) -> Persisted {
    let mut persisted = Persisted::default();

    match store.write(key, ArtifactKind::Html, bytes) {
        Ok(path) => {
            record_write(ArtifactKind::Html, Ok(()));
            info!(
                target = SOURCE,
                op = "write",
                kind = "html",
                path = %path.display(),
                bytes = bytes.len(),
                "artifact written"
            );
            persisted.html = true;
        }
        Err(err) => {
            record_write(ArtifactKind::Html, Err(&err));
            return persisted;
        }
    }

    let Some(level) = gzip_level else {
        return persisted;
    };

    let compressed = match gzip(bytes, level) {
        Ok(compressed) => compressed,
        Err(source) => {
            let err = StoreError::Write {
                path: store.path(key, ArtifactKind::Gzip),
                source,
            };
            record_write(ArtifactKind::Gzip, Err(&err));
            return persisted;
        }
    };

    match store.write(key, ArtifactKind::Gzip, &compressed) {
        Ok(path) => {
            record_write(ArtifactKind::Gzip, Ok(()));
            info!(
                target = SOURCE,
                op = "write",
                kind = "gz",
                path = %path.display(),
                bytes = compressed.len(),
                "artifact written"
            );
            persisted.gzip = true;
        }
        Err(err) => record_write(ArtifactKind::Gzip, Err(&err)),
    }

    persisted
}

fn record_write(kind: ArtifactKind, result: Result<(), &StoreError>) {
    let outcome = if result.is_ok() { "ok" } else { "error" };
    counter!(
        METRIC_ARTIFACT_WRITE_TOTAL,
        "kind" => kind.extension(),
        "result" => outcome
    )
    .increment(1);

    if let Err(err) = result {
        warn!(
            target = SOURCE,
            op = "write",
            kind = kind.extension(),
            error = %err,
            "artifact write failed"
        );
    }
}

pub(crate) fn gzip(bytes: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::new(level));
    encoder.write_all(bytes)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;
    use tempfile::TempDir;
    use url::Url;

    use super::*;

    fn page(url: &str, secure: bool) -> PageContext {
        PageContext::new(CanonicalUrl::new(&Url::parse(url).expect("url")), secure)
    }

    fn pipeline(root: &TempDir, config: CacheConfig) -> (Pipeline, Arc<ArtifactStore>) {
        let store = Arc::new(ArtifactStore::open(root.path()).expect("store"));
        let pipeline = Pipeline::new(config, Arc::clone(&store), None, ScriptLoading::default());
        (pipeline, store)
    }

    fn long_page(body: &str) -> String {
        format!(
            "<html><head><title>t</title></head><body>{body}<p>{}</p></body></html>",
            "lorem ipsum ".repeat(30)
        )
    }

    #[tokio::test]
    async fn short_bodies_are_neither_transformed_nor_stored() {
        let root = TempDir::new().expect("tempdir");
        let (pipeline, store) = pipeline(&root, CacheConfig::default());
        let page = page("https://example.com/frag/", true);
        let body = "<p>http://example.com/x</p>".to_string();

        let out = pipeline.process(&page, body.clone()).await;
        assert_eq!(out.body, body);
        assert_eq!(out.persisted, Persisted::default());
        let key = CacheKey::for_url(&page.url);
        assert!(store.read(&key, ArtifactKind::Html).expect("read").is_none());
    }

    #[tokio::test]
    async fn writes_plain_and_gzip_artifacts() {
        let root = TempDir::new().expect("tempdir");
        let (pipeline, store) = pipeline(&root, CacheConfig::default());
        let page = page("https://example.com/post/", true);
        let body = long_page(r#"<img src="http://example.com/x.png">"#);

        let out = pipeline.process(&page, body).await;
        assert!(out.body.contains(r#"<img src="https://example.com/x.png">"#));
        assert_eq!(
            out.persisted,
            Persisted {
                html: true,
                gzip: true
            }
        );

        let key = CacheKey::for_url(&page.url);
        let html = store
            .read(&key, ArtifactKind::Html)
            .expect("read")
            .expect("html");
        assert_eq!(&html[..], out.body.as_bytes());

        let gz = store
            .read(&key, ArtifactKind::Gzip)
            .expect("read")
            .expect("gz");
        let mut decoded = String::new();
        GzDecoder::new(&gz[..])
            .read_to_string(&mut decoded)
            .expect("gunzip");
        assert_eq!(decoded, out.body);
    }

    #[tokio::test]
    async fn insecure_pages_keep_their_references() {
        let root = TempDir::new().expect("tempdir");
        let (pipeline, _) = pipeline(&root, CacheConfig::default());
        let body = long_page(r#"<img src="http://example.com/x.png">"#);

        let out = pipeline.process(&page("http://example.com/a/", false), body.clone()).await;
        assert_eq!(out.body, body);
    }

    #[tokio::test]
    async fn minifies_when_enabled_and_skips_gzip_when_disabled() {
        let root = TempDir::new().expect("tempdir");
        let config = CacheConfig {
            gzip: false,
            minify_html: true,
            ..CacheConfig::default()
        };
        let (pipeline, store) = pipeline(&root, config);
        let page = page("https://example.com/min/", false);
        let body = long_page("<!-- note -->\n\n<div>\n<span>x</span>\n</div>");

        let out = pipeline.process(&page, body).await;
        assert!(out.body.contains("<div><span>x</span></div>"));
        assert!(!out.body.contains("note"));
        assert_eq!(
            out.persisted,
            Persisted {
                html: true,
                gzip: false
            }
        );
        let key = CacheKey::for_url(&page.url);
        assert!(store.read(&key, ArtifactKind::Gzip).expect("read").is_none());
    }

    #[tokio::test]
    async fn write_failure_still_returns_the_body() {
        let root = TempDir::new().expect("tempdir");
        let (pipeline, store) = pipeline(&root, CacheConfig::default());
        let page = page("https://example.com/blocked/", false);
        let key = CacheKey::for_url(&page.url);
        // A directory where the artifact should go makes the rename fail.
        std::fs::create_dir_all(store.path(&key, ArtifactKind::Html)).expect("mkdir");

        let body = long_page("<p>ok</p>");
        let out = pipeline.process(&page, body.clone()).await;
        assert_eq!(out.body, body);
        assert_eq!(out.persisted, Persisted::default());
        assert!(store.read(&key, ArtifactKind::Gzip).expect("read").is_none());
    }

    #[tokio::test]
    async fn gzip_failure_keeps_the_plain_artifact() {
        let root = TempDir::new().expect("tempdir");
        let (pipeline, store) = pipeline(&root, CacheConfig::default());
        let page = page("https://example.com/half/", false);
        let key = CacheKey::for_url(&page.url);
        std::fs::create_dir_all(store.path(&key, ArtifactKind::Gzip)).expect("mkdir");

        let body = long_page("<p>ok</p>");
        let out = pipeline.process(&page, body.clone()).await;
        assert_eq!(out.body, body);
        assert_eq!(
            out.persisted,
            Persisted {
                html: true,
                gzip: false
            }
        );
        let html = store
            .read(&key, ArtifactKind::Html)
            .expect("read")
            .expect("html artifact");
        assert_eq!(&html[..], body.as_bytes());
    }

    #[test]
    fn gzip_roundtrips() {
        let compressed = gzip(b"hello hello hello", 6).expect("gzip");
        let mut decoded = String::new();
        GzDecoder::new(&compressed[..])
            .read_to_string(&mut decoded)
            .expect("gunzip");
        assert_eq!(decoded, "hello hello hello");
    }
}
