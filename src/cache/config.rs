//! Runtime cache configuration, projected from [`crate::config::Settings`].

use crate::transform::MinifyOptions;

pub const DEFAULT_GZIP_LEVEL: u32 = 9;
pub const DEFAULT_MIN_BODY_BYTES: usize = 255;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Capture and persist pages at all.
    pub enabled: bool,
    /// Also write a gzip artifact beside each page.
    pub gzip: bool,
    pub gzip_level: u32,
    /// Bodies shorter than this are passed through untouched.
    pub min_body_bytes: usize,
    /// Answer gate-passing requests from stored artifacts.
    pub serve_hits: bool,
    pub minify_html: bool,
    pub minify: MinifyOptions,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gzip: true,
            gzip_level: DEFAULT_GZIP_LEVEL,
            min_body_bytes: DEFAULT_MIN_BODY_BYTES,
            serve_hits: true,
            minify_html: false,
            minify: MinifyOptions::default(),
        }
    }
}

impl From<&crate::config::Settings> for CacheConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            enabled: settings.cache.enabled,
            gzip: settings.cache.gzip,
            gzip_level: settings.cache.gzip_level,
            min_body_bytes: settings.cache.min_body_bytes,
            serve_hits: settings.cache.serve_hits,
            minify_html: settings.minify.html,
            minify: settings.minify.options,
        }
    }
}
