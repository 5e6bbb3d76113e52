//! Stylesheet consolidation.
//!
//! Collects a document's external and inline stylesheets, folds them into one
//! content-addressed file, and rewrites the document to load only that file.

use std::{cell::RefCell, collections::HashSet, rc::Rc, sync::Arc};

use lol_html::{
    RewriteStrSettings, element, errors::RewritingError, html_content::ContentType, rewrite_str,
    text,
};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::{css_minify::CssBundle, fetch::StylesheetSource};
use crate::cache::{
    keys::fingerprint,
    store::{ArtifactStore, StoreError},
};

/// Default public prefix under which consolidated stylesheets are served.
pub const DEFAULT_PUBLIC_PATH: &str = "/cache/presscache/css";

#[derive(Debug, Error)]
pub enum CssError {
    #[error("failed to rewrite document: {0}")]
    Rewrite(#[from] RewritingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("stylesheet persistence task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct CssConfig {
    pub minify: bool,
    pub process_external: bool,
    /// Substrings of a stylesheet reference that keep it out of consolidation.
    pub excluded_patterns: Vec<String>,
    /// URL path prefix under which the stylesheet directory is served.
    pub public_path: String,
}

impl Default for CssConfig {
    fn default() -> Self {
        Self {
            minify: true,
            process_external: false,
            excluded_patterns: Vec::new(),
            public_path: DEFAULT_PUBLIC_PATH.to_string(),
        }
    }
}

/// Stylesheet sources found in one document.
#[derive(Debug, Default)]
struct FoundStylesheets {
    links: Vec<String>,
    inline: Vec<String>,
    has_head: bool,
}

impl FoundStylesheets {
    fn is_empty(&self) -> bool {
        self.links.is_empty() && self.inline.is_empty()
    }
}

pub struct CssOptimizer {
    config: CssConfig,
    store: Arc<ArtifactStore>,
    source: Arc<dyn StylesheetSource>,
}

impl CssOptimizer {
    pub fn new(config: CssConfig, store: Arc<ArtifactStore>, source: Arc<dyn StylesheetSource>) -> Self {
        Self {
            config,
            store,
            source,
        }
    }

    /// Consolidate the stylesheets of `html`, served at `page_url`.
    ///
    /// Returns `Ok(None)` when there is nothing to consolidate; the caller
    /// keeps the document as it was.
    pub async fn optimize(&self, html: &str, page_url: &Url) -> Result<Option<String>, CssError> {
        let found = find_stylesheets(html)?;
        if found.is_empty() || !found.has_head {
            return Ok(None);
        }

        let mut bundle = CssBundle::new();
        let mut included = HashSet::new();
        for href in &found.links {
            let Some(url) = self.admit(href, page_url) else {
                continue;
            };
            let same_origin = is_same_origin(&url, page_url);
            match self.source.fetch(&url, same_origin).await {
                Ok(css) => {
                    bundle.push(&css, Some(&url));
                    included.insert(href.clone());
                }
                Err(err) => {
                    warn!(
                        target = "presscache::transform::css",
                        href = %url,
                        error = %err,
                        "stylesheet fetch failed; leaving link in place"
                    );
                }
            }
        }
        for body in &found.inline {
            bundle.push(body, Some(page_url));
        }

        if bundle.is_empty() {
            return Ok(None);
        }

        let css = bundle.finish(self.config.minify);
        let digest = fingerprint(css.as_bytes());
        let store = Arc::clone(&self.store);
        let artifact =
            tokio::task::spawn_blocking(move || store.write_stylesheet(&digest, &css)).await??;

        debug!(
            target = "presscache::transform::css",
            file = %artifact.file_name,
            created = artifact.created,
            links = included.len(),
            inline = found.inline.len(),
            "consolidated stylesheets"
        );

        let href = format!(
            "{}/{}",
            self.config.public_path.trim_end_matches('/'),
            artifact.file_name
        );
        rewrite_document(html, &included, &href).map(Some)
    }

    /// Resolve `href` and decide whether it takes part in consolidation.
    fn admit(&self, href: &str, page_url: &Url) -> Option<Url> {
        let url = page_url.join(href).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        if self
            .config
            .excluded_patterns
            .iter()
            .any(|pattern| !pattern.is_empty() && href.contains(pattern.as_str()))
        {
            debug!(target = "presscache::transform::css", href, "stylesheet excluded");
            return None;
        }
        if !self.config.process_external && !is_same_origin(&url, page_url) {
            return None;
        }
        Some(url)
    }
}

fn is_same_origin(url: &Url, page_url: &Url) -> bool {
    url.host_str()
        .zip(page_url.host_str())
        .is_some_and(|(a, b)| a.eq_ignore_ascii_case(b))
        && url.port_or_known_default() == page_url.port_or_known_default()
}

fn is_stylesheet_link(rel: Option<String>) -> bool {
    rel.is_some_and(|rel| {
        rel.split_ascii_whitespace()
            .any(|token| token.eq_ignore_ascii_case("stylesheet"))
    })
}

fn find_stylesheets(html: &str) -> Result<FoundStylesheets, CssError> {
    let found = Rc::new(RefCell::new(FoundStylesheets::default()));

    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("head", {
                    let found = Rc::clone(&found);
                    move |_| {
                        found.borrow_mut().has_head = true;
                        Ok(())
                    }
                }),
                element!("link[href]", {
                    let found = Rc::clone(&found);
                    move |el| {
                        if is_stylesheet_link(el.get_attribute("rel"))
                            && let Some(href) = el.get_attribute("href")
                        {
                            found.borrow_mut().links.push(href);
                        }
                        Ok(())
                    }
                }),
                element!("style", {
                    let found = Rc::clone(&found);
                    move |_| {
                        found.borrow_mut().inline.push(String::new());
                        Ok(())
                    }
                }),
                text!("style", {
                    let found = Rc::clone(&found);
                    move |chunk| {
                        if let Some(body) = found.borrow_mut().inline.last_mut() {
                            body.push_str(chunk.as_str());
                        }
                        Ok(())
                    }
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )?;

    Ok(found.take())
}

/// Drop included links and every inline style, then reference the
/// consolidated file right after the opening `<head>` tag.
fn rewrite_document(html: &str, included: &HashSet<String>, href: &str) -> Result<String, CssError> {
    let tag = format!("\n<link rel=\"stylesheet\" href=\"{}\" />", escape_attribute(href));
    let inserted = Rc::new(RefCell::new(false));

    let rewritten = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("head", {
                    let inserted = Rc::clone(&inserted);
                    move |el| {
                        let mut inserted = inserted.borrow_mut();
                        if !*inserted {
                            el.prepend(&tag, ContentType::Html);
                            *inserted = true;
                        }
                        Ok(())
                    }
                }),
                element!("link[href]", |el| {
                    if is_stylesheet_link(el.get_attribute("rel"))
                        && el
                            .get_attribute("href")
                            .is_some_and(|href| included.contains(&href))
                    {
                        el.remove();
                    }
                    Ok(())
                }),
                element!("style", |el| {
                    el.remove();
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )?;

    Ok(rewritten)
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::transform::fetch::FetchError;

    struct FixedSource(HashMap<String, String>);

    #[async_trait]
    impl StylesheetSource for FixedSource {
        async fn fetch(&self, url: &Url, _same_origin: bool) -> Result<String, FetchError> {
            self.0.get(url.as_str()).cloned().ok_or_else(|| FetchError::Io {
                path: url.path().into(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        }
    }

    fn optimizer(root: &TempDir, sheets: &[(&str, &str)], config: CssConfig) -> CssOptimizer {
        let store = Arc::new(ArtifactStore::open(root.path()).expect("store"));
        let source = FixedSource(
            sheets
                .iter()
                .map(|(url, css)| (url.to_string(), css.to_string()))
                .collect(),
        );
        CssOptimizer::new(config, store, Arc::new(source))
    }

    fn page() -> Url {
        Url::parse("https://example.com/blog/post/").expect("url")
    }

    #[tokio::test]
    async fn document_without_stylesheets_is_untouched() {
        let root = TempDir::new().expect("tempdir");
        let opt = optimizer(&root, &[], CssConfig::default());
        let html = "<html><head><title>x</title></head><body>hi</body></html>";

        assert!(opt.optimize(html, &page()).await.expect("optimize").is_none());
        let written = std::fs::read_dir(root.path().join("css"))
            .expect("css dir")
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.file_name() != "index.html")
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(written, 0);
    }

    #[tokio::test]
    async fn consolidates_links_and_inline_styles() {
        let root = TempDir::new().expect("tempdir");
        let opt = optimizer(
            &root,
            &[("https://example.com/a.css", "body { color: red; }")],
            CssConfig::default(),
        );
        let html = concat!(
            "<html><head><link rel=\"stylesheet\" href=\"/a.css\">",
            "<style>p { margin: 0; }</style></head><body>x</body></html>"
        );

        let out = opt
            .optimize(html, &page())
            .await
            .expect("optimize")
            .expect("rewritten");

        let css = "body{color:red}\np{margin:0}";
        let css = crate::transform::css_minify::minify_css(css);
        let file = format!("optimized_{}.css", fingerprint(css.as_bytes()));
        assert_eq!(
            out,
            format!(
                "<html><head>\n<link rel=\"stylesheet\" href=\"/cache/presscache/css/{file}\" /></head><body>x</body></html>"
            )
        );
        let stored = std::fs::read_to_string(root.path().join("css").join(&file)).expect("css file");
        assert_eq!(stored, "body{color:red}p{margin:0}");
    }

    #[tokio::test]
    async fn cross_origin_and_excluded_links_stay() {
        let root = TempDir::new().expect("tempdir");
        let config = CssConfig {
            excluded_patterns: vec!["print".to_string()],
            ..CssConfig::default()
        };
        let opt = optimizer(
            &root,
            &[
                ("https://example.com/main.css", ".a{}"),
                ("https://example.com/print.css", ".p{}"),
                ("https://cdn.other.net/lib.css", ".c{}"),
            ],
            config,
        );
        let html = concat!(
            "<html><head>",
            "<link rel=\"stylesheet\" href=\"/main.css\">",
            "<link rel=\"stylesheet\" href=\"/print.css\">",
            "<link rel=\"stylesheet\" href=\"https://cdn.other.net/lib.css\">",
            "</head><body></body></html>"
        );

        let out = opt
            .optimize(html, &page())
            .await
            .expect("optimize")
            .expect("rewritten");
        assert!(!out.contains("href=\"/main.css\""));
        assert!(out.contains("href=\"/print.css\""));
        assert!(out.contains("href=\"https://cdn.other.net/lib.css\""));
    }

    #[tokio::test]
    async fn failed_fetch_keeps_its_link() {
        let root = TempDir::new().expect("tempdir");
        let opt = optimizer(
            &root,
            &[("https://example.com/ok.css", ".ok{color:red}")],
            CssConfig::default(),
        );
        let html = concat!(
            "<html><head>",
            "<link rel=\"stylesheet\" href=\"/ok.css\">",
            "<link rel=\"stylesheet\" href=\"/gone.css\">",
            "</head><body></body></html>"
        );

        let out = opt
            .optimize(html, &page())
            .await
            .expect("optimize")
            .expect("rewritten");
        assert!(!out.contains("href=\"/ok.css\""));
        assert!(out.contains("href=\"/gone.css\""));
        assert!(out.contains("/cache/presscache/css/optimized_"));
    }

    #[tokio::test]
    async fn identical_output_reuses_the_artifact() {
        let root = TempDir::new().expect("tempdir");
        let opt = optimizer(&root, &[], CssConfig::default());
        let html = "<html><head><style>.x { top: 0; }</style></head><body></body></html>";

        let first = opt.optimize(html, &page()).await.expect("first");
        let second = opt.optimize(html, &page()).await.expect("second");
        assert_eq!(first, second);

        let files = std::fs::read_dir(root.path().join("css"))
            .expect("css dir")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("optimized_"))
            .count();
        assert_eq!(files, 1);
    }
}
