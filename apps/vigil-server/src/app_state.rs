use std::sync::Arc;

use crate::breaker::BreakerRegistry;
use crate::config::EngineConfig;
use crate::governor::Governor;
use crate::metrics::Metrics;
use crate::request_manager::RequestManager;
use crate::store::Store;

/// Root of the engine: every long-lived component, shared by handle. No
/// component is reachable except through here, which keeps ownership of the
/// caches, breakers and the cookie jar in one place.
#[derive(Clone)]
pub struct AppState {
    config: Arc<EngineConfig>,
    store: Store,
    governor: Arc<Governor>,
    breakers: Arc<BreakerRegistry>,
    requests: Arc<RequestManager>,
    metrics: Arc<Metrics>,
}

impl AppState {
    pub(crate) fn new(
        config: Arc<EngineConfig>,
        store: Store,
        governor: Arc<Governor>,
        breakers: Arc<BreakerRegistry>,
        requests: Arc<RequestManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            store,
            governor,
            breakers,
            requests,
            metrics,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn requests(&self) -> &RequestManager {
        &self.requests
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}
