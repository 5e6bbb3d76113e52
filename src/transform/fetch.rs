//! Stylesheet retrieval for the CSS optimizer.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http error fetching `{url}`: {source}")]
    Http {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where consolidated stylesheets come from.
#[async_trait]
pub trait StylesheetSource: Send + Sync {
    /// Return the text of the stylesheet at `url`.
    ///
    /// `same_origin` is true when `url` shares the page's host, which allows
    /// implementations to read it from local storage instead.
    async fn fetch(&self, url: &Url, same_origin: bool) -> Result<String, FetchError>;
}

/// Fetches stylesheets over HTTP, preferring a local document root for
/// same-origin files when one is configured.
#[derive(Debug, Clone)]
pub struct HttpStylesheetSource {
    client: Client,
    document_root: Option<PathBuf>,
}

impl HttpStylesheetSource {
    pub fn new(timeout: Duration, document_root: Option<PathBuf>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("presscache/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            document_root,
        })
    }

    async fn read_local(&self, url: &Url) -> Result<Option<String>, FetchError> {
        let Some(path) = self
            .document_root
            .as_deref()
            .and_then(|root| local_path(root, url))
        else {
            return Ok(None);
        };

        match tokio::fs::read_to_string(&path).await {
            Ok(css) => {
                debug!(
                    target = "presscache::transform::fetch",
                    path = %path.display(),
                    "read stylesheet from document root"
                );
                Ok(Some(css))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(FetchError::Io { path, source }),
        }
    }
}

#[async_trait]
impl StylesheetSource for HttpStylesheetSource {
    async fn fetch(&self, url: &Url, same_origin: bool) -> Result<String, FetchError> {
        if same_origin && let Some(css) = self.read_local(url).await? {
            return Ok(css);
        }

        let http_error = |source| FetchError::Http {
            url: url.clone(),
            source,
        };
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(http_error)?;
        response.text().await.map_err(http_error)
    }
}

/// Map a URL path onto `root`, refusing anything that could leave it.
fn local_path(root: &Path, url: &Url) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in url.path_segments()? {
        if segment.is_empty() {
            continue;
        }
        if segment == "." || segment == ".." || segment.contains(['%', '\\']) {
            return None;
        }
        path.push(segment);
    }
    (path != root).then_some(path)
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn local_path_stays_under_root() {
        let root = Path::new("/srv/site");
        let url = Url::parse("https://example.com/wp-content/themes/a/style.css").expect("url");
        assert_eq!(
            local_path(root, &url),
            Some(PathBuf::from("/srv/site/wp-content/themes/a/style.css"))
        );

        let encoded = Url::parse("https://example.com/css/..%2F..%2Fetc/passwd").expect("url");
        assert_eq!(local_path(root, &encoded), None);

        let bare = Url::parse("https://example.com/").expect("url");
        assert_eq!(local_path(root, &bare), None);
    }

    #[tokio::test]
    async fn fetches_over_http() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method("GET").path("/style.css");
                then.status(200).body("body { color: red; }");
            })
            .await;

        let source = HttpStylesheetSource::new(Duration::from_secs(2), None).expect("client");
        let url = Url::parse(&server.url("/style.css")).expect("url");
        let css = source.fetch(&url, false).await.expect("fetch");

        assert_eq!(css, "body { color: red; }");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn error_status_is_a_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method("GET").path("/missing.css");
                then.status(404);
            })
            .await;

        let source = HttpStylesheetSource::new(Duration::from_secs(2), None).expect("client");
        let url = Url::parse(&server.url("/missing.css")).expect("url");
        assert!(matches!(
            source.fetch(&url, false).await,
            Err(FetchError::Http { .. })
        ));
    }

    #[tokio::test]
    async fn same_origin_prefers_document_root() {
        let root = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(root.path().join("css")).expect("mkdir");
        std::fs::write(root.path().join("css/site.css"), "p{margin:0}").expect("write");

        let source = HttpStylesheetSource::new(
            Duration::from_secs(2),
            Some(root.path().to_path_buf()),
        )
        .expect("client");
        // Nothing listens here; a network fetch would fail.
        let url = Url::parse("http://127.0.0.1:9/css/site.css").expect("url");

        assert_eq!(source.fetch(&url, true).await.expect("fetch"), "p{margin:0}");
    }
}
