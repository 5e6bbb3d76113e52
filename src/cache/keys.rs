//! Cache key definitions.
//!
//! A page is identified by its canonical URL: scheme and host normalized,
//! query string and fragment dropped. The key is a SHA-256 fingerprint of
//! that URL, rendered as lowercase hex so it is safe to use as a file stem.

use std::fmt;

use sha2::{Digest, Sha256};
use url::Url;

/// Length of a rendered key in hex characters.
pub const KEY_HEX_LEN: usize = 64;

/// A request URL reduced to the identity used for caching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalUrl(Url);

impl CanonicalUrl {
    /// Canonicalize an absolute URL.
    ///
    /// `Url` already lowercases scheme and host; the query string and
    /// fragment are removed here.
    pub fn new(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_query(None);
        url.set_fragment(None);
        Self(url)
    }

    /// Build a canonical URL from request parts (`scheme`, `Host` header, path).
    pub fn from_parts(scheme: &str, host: &str, path: &str) -> Option<Self> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Url::parse(&format!("{scheme}://{host}{path}"))
            .ok()
            .map(|url| Self::new(&url))
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// Fixed-length fingerprint of a canonical URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_url(url: &CanonicalUrl) -> Self {
        Self(fingerprint(url.as_str().as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// True when `value` has the exact shape produced by [`fingerprint`].
pub fn is_fingerprint(value: &str) -> bool {
    value.len() == KEY_HEX_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
