//! Full-page cache.
//!
//! - **Gate** ([`gate`]): decides whether a request may be cached at all.
//! - **Keys & store** ([`keys`], [`store`]): canonical URL → fingerprint →
//!   `<root>/<key>.html` / `<root>/<key>.gz`.
//! - **Pipeline** ([`pipeline`]): transforms a captured page and persists it.
//! - **Invalidator** ([`invalidator`]): removes artifacts on host events.
//!
//! The axum middleware in [`middleware`] ties the read and write paths
//! together with the same key derivation.

mod config;
pub mod events;
pub mod gate;
pub mod invalidator;
pub mod keys;
mod middleware;
pub mod pipeline;
pub mod store;

pub use config::{CacheConfig, DEFAULT_GZIP_LEVEL, DEFAULT_MIN_BODY_BYTES};
pub use events::{CacheEvent, ContentId, NoPermalinks, PermalinkResolver};
pub use gate::{BypassReason, GateDecision, GateRules, RequestFacts};
pub use invalidator::{Cleared, Invalidator};
pub use keys::{CacheKey, CanonicalUrl};
pub use middleware::{CACHE_STATUS_HEADER, CacheState, MAX_CAPTURE_BYTES, response_cache_layer};
pub use pipeline::{PageContext, Persisted, Pipeline, Processed};
pub use store::{ArtifactKind, ArtifactStore, StoreError};
