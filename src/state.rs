//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::gateway::GatewayManager;
use crate::sessions::SessionRegistry;
use crate::store::SessionStore;

/// Shared application state for the gatekeep server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Session descriptors, assets, credentials and properties.
    pub store: SessionStore,
    /// Sessions that currently have a browser attached.
    pub registry: SessionRegistry,
    /// Pooled access-gateway links and per-session forwards.
    pub gateways: GatewayManager,
}

impl AppState {
    /// Seed the store from `config` and start the registry actor. Must be
    /// called from within a Tokio runtime.
    pub fn new(config: Config) -> Self {
        let store = SessionStore::new(
            config.assets.clone(),
            config.credentials.clone(),
            config.properties.clone(),
        );
        let gateways = GatewayManager::new(config.gateways.clone());
        let registry = SessionRegistry::spawn(store.clone(), gateways.clone());
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            store,
            registry,
            gateways,
        }
    }
}
