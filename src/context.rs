use std::sync::Arc;

use anyhow::Result;

use crate::adapters::{EndpointRegistry, Location};
use crate::config::AppConfig;
use crate::core::{Endpoint, Orchestrator, ProgressSink};

/// Everything a command needs, built once from the loaded config.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub registry: Arc<EndpointRegistry>,
    pub orchestrator: Orchestrator,
}

impl AppContext {
    pub fn new(config: AppConfig, sink: Arc<dyn ProgressSink>) -> Self {
        let registry = EndpointRegistry::with_builtin(config.sync_files);
        let orchestrator = Orchestrator::new(config.transfer_options(), sink);
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            orchestrator,
        }
    }

    /// Endpoint for the protocol and host of `location`.
    pub fn endpoint_for(&self, location: &Location) -> Result<Box<dyn Endpoint>> {
        self.registry.open(&location.protocol, &location.host)
    }
}
