pub mod config;
pub mod errors;
pub mod models;
pub mod parsers;
pub mod services;

use std::sync::Arc;

use errors::EngineError;
use services::catalog::{AttackCatalog, CatalogHandle};
use services::ingestion::ImportOrchestrator;

/// Shared engine state handed to every caller.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub config: config::EngineConfig,
    pub catalog: Arc<CatalogHandle>,
    pub orchestrator: Arc<ImportOrchestrator>,
}

impl EngineState {
    /// Load the attack catalog named by `config` and build the orchestrator.
    pub fn from_config(config: config::EngineConfig) -> Result<Self, EngineError> {
        let catalog = AttackCatalog::from_path(&config.attack_catalog_path)?;
        tracing::info!(
            path = %config.attack_catalog_path.display(),
            entries = catalog.len(),
            "Attack catalog loaded"
        );
        Ok(Self::with_catalog(config, catalog))
    }

    pub fn with_catalog(config: config::EngineConfig, catalog: AttackCatalog) -> Self {
        let catalog = Arc::new(CatalogHandle::new(catalog));
        let orchestrator = Arc::new(ImportOrchestrator::new(
            Arc::clone(&catalog),
            config.correlation_concurrency,
        ));
        Self {
            config,
            catalog,
            orchestrator,
        }
    }
}
