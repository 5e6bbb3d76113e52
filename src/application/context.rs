//! The application context: every long-lived collaborator, built once from
//! [`Settings`] and handed to whoever needs it.

use std::sync::Arc;

use tracing::info;

use crate::{
    cache::{
        ArtifactStore, CacheConfig, CacheState, GateRules, Invalidator, PermalinkResolver,
        Pipeline,
    },
    config::Settings,
    infra::error::InfraError,
    transform::{CssOptimizer, HttpStylesheetSource},
};

pub struct AppContext {
    pub store: Arc<ArtifactStore>,
    pub pipeline: Arc<Pipeline>,
    pub invalidator: Arc<Invalidator>,
    pub gate: GateRules,
}

impl AppContext {
    /// Open the cache root and wire the pipeline and invalidator.
    ///
    /// Fails when the cache root cannot be prepared or the stylesheet client
    /// cannot be built; nothing else here is fatal.
    pub fn build(
        settings: &Settings,
        permalinks: Arc<dyn PermalinkResolver>,
    ) -> Result<Self, InfraError> {
        let store = Arc::new(ArtifactStore::open(&settings.cache.root)?);
        info!(
            target = "presscache::application::context",
            root = %store.root().display(),
            "cache root ready"
        );

        let css = if settings.css.optimize {
            let source = HttpStylesheetSource::new(
                settings.css.fetch_timeout,
                settings.css.document_root.clone(),
            )?;
            Some(CssOptimizer::new(
                settings.css.optimizer_config(),
                Arc::clone(&store),
                Arc::new(source),
            ))
        } else {
            None
        };

        let pipeline = Arc::new(Pipeline::new(
            CacheConfig::from(settings),
            Arc::clone(&store),
            css,
            settings.scripts.clone(),
        ));
        let invalidator = Arc::new(Invalidator::new(Arc::clone(&store), permalinks));

        Ok(Self {
            store,
            pipeline,
            invalidator,
            gate: settings.gate.clone(),
        })
    }

    pub fn cache_state(&self) -> CacheState {
        CacheState::new(
            self.gate.clone(),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.store),
        )
    }
}
