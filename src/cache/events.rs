//! Lifecycle signals from the host that invalidate cached pages.

use std::fmt;

use url::Url;

/// Opaque identity of a piece of host content (a post, a page, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Events the host delivers to the invalidator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Content was published or updated.
    ContentSaved { id: ContentId },
    /// A comment was posted on content.
    CommentPosted { content_id: ContentId },
    /// Content was moved to the trash.
    ContentTrashed { id: ContentId },
    ThemeSwitched,
    SettingsChanged,
    /// Explicit administrative purge.
    AdminPurge,
    /// The cache is being switched off.
    Deactivated,
}

impl CacheEvent {
    /// The content this event is scoped to, or `None` for site-wide events.
    pub fn content_id(&self) -> Option<&ContentId> {
        match self {
            Self::ContentSaved { id } | Self::ContentTrashed { id } => Some(id),
            Self::CommentPosted { content_id } => Some(content_id),
            Self::ThemeSwitched | Self::SettingsChanged | Self::AdminPurge | Self::Deactivated => {
                None
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContentSaved { .. } => "content_saved",
            Self::CommentPosted { .. } => "comment_posted",
            Self::ContentTrashed { .. } => "content_trashed",
            Self::ThemeSwitched => "theme_switched",
            Self::SettingsChanged => "settings_changed",
            Self::AdminPurge => "admin_purge",
            Self::Deactivated => "deactivated",
        }
    }
}

/// Maps content identities to their public URLs. Supplied by the host.
pub trait PermalinkResolver: Send + Sync {
    fn permalink(&self, id: &ContentId) -> Option<Url>;
}

/// Resolver for hosts that cannot map identities; every lookup misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPermalinks;

impl PermalinkResolver for NoPermalinks {
    fn permalink(&self, _id: &ContentId) -> Option<Url> {
        None
    }
}
