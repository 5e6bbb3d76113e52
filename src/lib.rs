//! presscache: a full-page response cache for dynamic sites.
//!
//! Cacheable requests are answered from pre-rendered artifacts on disk;
//! misses are rendered upstream, rewritten (protocol fixes, script loading,
//! stylesheet consolidation, HTML minification) and persisted as plain and
//! gzip artifacts.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
pub mod transform;
