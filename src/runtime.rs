//! A single constructible value bundling every collaborator a worker
//! needs: the bus, the client registry, the filesystem backend, and the
//! config they were built from.

use std::sync::Arc;

use crate::backend::FsBackend;
use crate::bus::{Bus, NatsBus};
use crate::config::Config;
use crate::registry::ClientRegistry;
use crate::Result;

#[derive(Clone)]
pub struct Runtime {
    pub bus: Arc<dyn Bus>,
    pub registry: Arc<ClientRegistry>,
    pub backend: Arc<FsBackend>,
    pub config: Arc<Config>,
}

impl Runtime {
    /// Connect to the bus and assemble a `Runtime` from `config`.
    pub async fn connect(config: Config) -> Result<Self> {
        let bus = NatsBus::connect(
            &config.bus.url,
            config.bus.credentials_path.as_deref(),
            config.bus.min_max_payload,
        )
        .await?;
        Ok(Self::with_bus(config, Arc::new(bus)))
    }

    /// Assemble a `Runtime` around an already-connected bus. Used directly
    /// by tests that supply a `MockBus`.
    pub fn with_bus(config: Config, bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            registry: Arc::new(ClientRegistry::new()),
            backend: Arc::new(FsBackend::new(config.repo_root.clone())),
            config: Arc::new(config),
        }
    }
}
