//! Removal of cached page artifacts.

use std::sync::Arc;

use metrics::counter;
use tracing::{info, warn};
use url::Url;

use super::{
    events::{CacheEvent, ContentId, PermalinkResolver},
    keys::{CacheKey, CanonicalUrl},
    store::{ArtifactStore, StoreError},
};

const SOURCE: &str = "presscache::cache::invalidator";
const METRIC_INVALIDATE_TOTAL: &str = "presscache_invalidate_total";

/// What an invalidation removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cleared {
    pub files: usize,
}

pub struct Invalidator {
    store: Arc<ArtifactStore>,
    permalinks: Arc<dyn PermalinkResolver>,
}

impl Invalidator {
    pub fn new(store: Arc<ArtifactStore>, permalinks: Arc<dyn PermalinkResolver>) -> Self {
        Self { store, permalinks }
    }

    /// Clear one content identity's artifacts, or everything when `target`
    /// is `None`.
    ///
    /// An identity without a resolvable permalink clears nothing.
    pub fn clear(&self, target: Option<&ContentId>) -> Result<Cleared, StoreError> {
        let Some(id) = target else {
            return self.clear_all();
        };

        match self.permalinks.permalink(id) {
            Some(url) => self.clear_url(&url),
            None => {
                warn!(
                    target = SOURCE,
                    op = "clear",
                    content_id = %id,
                    "no permalink for content; nothing cleared"
                );
                Ok(Cleared::default())
            }
        }
    }

    /// Remove both artifacts of the page at `url`.
    pub fn clear_url(&self, url: &Url) -> Result<Cleared, StoreError> {
        let canonical = CanonicalUrl::new(url);
        let key = CacheKey::for_url(&canonical);
        let files = self.store.remove(&key)?;

        counter!(METRIC_INVALIDATE_TOTAL, "scope" => "page").increment(1);
        info!(
            target = SOURCE,
            op = "clear",
            scope = "page",
            url = %canonical,
            key = %key,
            files,
            "invalidated page"
        );
        Ok(Cleared { files })
    }

    /// Remove every page artifact under the cache root.
    pub fn clear_all(&self) -> Result<Cleared, StoreError> {
        let files = self.store.clear_pages()?;

        counter!(METRIC_INVALIDATE_TOTAL, "scope" => "all").increment(1);
        info!(
            target = SOURCE,
            op = "clear",
            scope = "all",
            files,
            "invalidated all pages"
        );
        Ok(Cleared { files })
    }

    /// Remove consolidated stylesheets. Only for explicit administrative use;
    /// lifecycle events never touch them.
    pub fn purge_stylesheets(&self) -> Result<Cleared, StoreError> {
        let files = self.store.clear_stylesheets()?;

        counter!(METRIC_INVALIDATE_TOTAL, "scope" => "stylesheets").increment(1);
        info!(
            target = SOURCE,
            op = "purge_stylesheets",
            files,
            "purged consolidated stylesheets"
        );
        Ok(Cleared { files })
    }

    pub fn on_content_changed(&self, id: &ContentId) -> Result<Cleared, StoreError> {
        self.clear(Some(id))
    }

    pub fn on_global_invalidate(&self) -> Result<Cleared, StoreError> {
        self.clear(None)
    }

    /// Apply a host lifecycle event.
    pub fn handle(&self, event: &CacheEvent) -> Result<Cleared, StoreError> {
        info!(target = SOURCE, op = "handle", event = event.as_str(), "cache event");
        match event.content_id() {
            Some(id) => self.on_content_changed(id),
            None => self.on_global_invalidate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use super::*;
    use crate::cache::{events::NoPermalinks, store::ArtifactKind};

    struct Permalinks(HashMap<String, Url>);

    impl PermalinkResolver for Permalinks {
        fn permalink(&self, id: &ContentId) -> Option<Url> {
            self.0.get(id.as_str()).cloned()
        }
    }

    fn key_for(url: &str) -> CacheKey {
        CacheKey::for_url(&CanonicalUrl::new(&Url::parse(url).expect("url")))
    }

    fn seed(store: &ArtifactStore, url: &str) -> CacheKey {
        let key = key_for(url);
        store.write(&key, ArtifactKind::Html, b"<html>").expect("html");
        store.write(&key, ArtifactKind::Gzip, b"gz").expect("gz");
        key
    }

    #[test]
    fn content_event_clears_only_its_page() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(ArtifactStore::open(dir.path()).expect("store"));
        let post = seed(&store, "https://example.com/hello/");
        let other = seed(&store, "https://example.com/other/");

        let permalinks = Permalinks(HashMap::from([(
            "7".to_string(),
            Url::parse("https://example.com/hello/?preview=1").expect("url"),
        )]));
        let invalidator = Invalidator::new(Arc::clone(&store), Arc::new(permalinks));

        let cleared = invalidator
            .handle(&CacheEvent::CommentPosted {
                content_id: ContentId::new("7"),
            })
            .expect("clear");
        assert_eq!(cleared.files, 2);
        assert!(store.read(&post, ArtifactKind::Html).expect("read").is_none());
        assert!(store.read(&other, ArtifactKind::Html).expect("read").is_some());
        assert!(store.read(&other, ArtifactKind::Gzip).expect("read").is_some());
    }

    #[test]
    fn global_events_clear_everything() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(ArtifactStore::open(dir.path()).expect("store"));
        seed(&store, "https://example.com/a/");
        seed(&store, "https://example.com/b/");

        let invalidator = Invalidator::new(Arc::clone(&store), Arc::new(NoPermalinks));
        let cleared = invalidator.handle(&CacheEvent::ThemeSwitched).expect("clear");
        assert_eq!(cleared.files, 4);
        assert!(dir.path().join("index.html").is_file());

        let again = invalidator.on_global_invalidate().expect("clear empty");
        assert_eq!(again.files, 0);
    }

    #[test]
    fn unresolvable_content_is_a_no_op() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(ArtifactStore::open(dir.path()).expect("store"));
        let kept = seed(&store, "https://example.com/a/");

        let invalidator = Invalidator::new(Arc::clone(&store), Arc::new(NoPermalinks));
        let cleared = invalidator
            .on_content_changed(&ContentId::new("missing"))
            .expect("clear");
        assert_eq!(cleared.files, 0);
        assert!(store.read(&kept, ArtifactKind::Html).expect("read").is_some());
    }

    #[test]
    fn stylesheets_survive_page_invalidation() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(ArtifactStore::open(dir.path()).expect("store"));
        let digest = crate::cache::keys::fingerprint(b"a{}");
        let sheet = store.write_stylesheet(&digest, "a{}").expect("css");

        let invalidator = Invalidator::new(Arc::clone(&store), Arc::new(NoPermalinks));
        invalidator.handle(&CacheEvent::AdminPurge).expect("clear");
        assert!(sheet.path.is_file());

        assert_eq!(invalidator.purge_stylesheets().expect("purge").files, 1);
        assert!(!sheet.path.is_file());
    }
}
