pub mod api;
pub mod config;
pub mod engine;
pub mod executor;
pub mod forge;
pub mod gitops;
pub mod health;
pub mod ports;
pub mod queue;
pub mod store;
pub mod sweeper;
pub mod tunnel;
pub mod webhook;

use std::sync::Arc;
use std::time::Instant;

use envzilla_core::PayloadCipher;

use crate::config::Config;
use crate::engine::ContainerEngine;
use crate::forge::ForgeClient;
use crate::ports::PortAllocator;
use crate::queue::JobQueue;
use crate::store::{DeploymentRepository, DeploymentStore};
use crate::tunnel::TunnelManager;

/// Returns the controller version as baked in at compile time.
pub fn get_server_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Shared state handed to every handler, worker, and background loop.
pub struct AppState {
    pub config: Arc<Config>,
    pub store: DeploymentStore,
    pub queue: Arc<dyn JobQueue>,
    pub cipher: Arc<PayloadCipher>,
    pub engine: Arc<ContainerEngine>,
    pub tunnels: Arc<TunnelManager>,
    pub forge: Option<Arc<ForgeClient>>,
    pub ports: Arc<PortAllocator>,
    pub http: reqwest::Client,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: Config,
        repository: Arc<dyn DeploymentRepository>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let store = DeploymentStore::new(repository, config.record_ttl);
        let engine = Arc::new(ContainerEngine::new(config.engine_binary.clone()));
        let ports = Arc::new(PortAllocator::new(
            config.port_range_start,
            config.port_range_end,
        ));
        let tunnels = Arc::new(TunnelManager::new(config.tunnel.clone()));
        let forge = config
            .forge
            .as_ref()
            .map(|f| Arc::new(ForgeClient::new(f.app_id, f.private_key.clone())));
        let cipher = Arc::new(PayloadCipher::new(&config.webhook_secret));

        Self {
            config: Arc::new(config),
            store,
            queue,
            cipher,
            engine,
            tunnels,
            forge,
            ports,
            http: reqwest::Client::new(),
            started_at: Instant::now(),
        }
    }
}
