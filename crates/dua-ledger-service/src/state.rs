//! Application state.

use std::sync::Arc;

use dua_ledger_store::Store;

use crate::auth::JwksCache;
use crate::config::ServiceConfig;
use crate::jobs::{JobSubmitter, JobTracker, SettlementHandler};
use crate::providers::ProviderRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The storage backend.
    pub store: Arc<dyn Store>,

    /// Service configuration.
    pub config: Arc<ServiceConfig>,

    /// Configured generation providers.
    pub providers: ProviderRegistry,

    /// Background tracking of provider jobs.
    pub tracker: JobTracker,

    /// Job submission.
    pub submitter: JobSubmitter,

    /// JWKS keys for end-user tokens.
    pub jwks: Arc<JwksCache>,
}

impl AppState {
    /// Create the state, building provider adapters from `config`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Self {
        let providers = ProviderRegistry::from_config(&config);
        Self::with_providers(store, config, providers)
    }

    /// Create the state with an explicit set of providers.
    #[must_use]
    pub fn with_providers(
        store: Arc<dyn Store>,
        config: ServiceConfig,
        providers: ProviderRegistry,
    ) -> Self {
        if config.callback_secret.is_none() {
            tracing::warn!("CALLBACK_SECRET not set - provider callbacks will not be verified");
        }
        if config.public_base_url.is_none() {
            tracing::info!("PUBLIC_BASE_URL not set - jobs are tracked by polling only");
        }

        let config = Arc::new(config);
        let tracker = JobTracker::new(
            Arc::clone(&store),
            providers.clone(),
            SettlementHandler::new(Arc::clone(&store)),
            config.tracking.clone(),
        );
        let submitter = JobSubmitter::new(tracker.clone(), providers.clone(), Arc::clone(&config));
        let jwks = Arc::new(JwksCache::new(&config.auth_base_url));

        Self {
            store,
            config,
            providers,
            tracker,
            submitter,
            jwks,
        }
    }

    /// The settlement handler shared by the tracker.
    #[must_use]
    pub fn settlement(&self) -> &SettlementHandler {
        self.tracker.settlement()
    }
}
