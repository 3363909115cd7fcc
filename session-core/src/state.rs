//! Wiring of the core's components
//!
//! The embedder supplies storage, publication and transport; everything else
//! is owned here and shared through `Arc`s.

use std::sync::Arc;

use crate::config::Config;
use crate::device::{Bootstrap, BundleManager, BundlePublisher, DeviceStore};
use crate::error::SessionResult;
use crate::otr::{KeyMaterialCache, MessageProcessor, SessionRegistry};
use crate::pipeline::Transport;
use crate::storage::KeyStore;

pub struct SessionCore {
    pub config: Config,
    pub bootstrap: Bootstrap,
    pub key_cache: Arc<KeyMaterialCache>,
    pub registry: Arc<SessionRegistry>,
    pub processor: MessageProcessor,
}

impl SessionCore {
    pub async fn new(
        config: Config,
        store: Arc<dyn KeyStore>,
        publisher: Arc<dyn BundlePublisher>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let device_store = DeviceStore::new(store.clone());
        let bundle_manager = BundleManager::new(device_store.clone(), publisher, config.prekeys.clone());
        let bootstrap = Bootstrap::new(config.device_name.clone(), device_store, bundle_manager);

        let key_cache = KeyMaterialCache::new(store, config.key_generation).await;
        let registry = Arc::new(SessionRegistry::new(key_cache.clone(), transport, config.clone()));
        let processor = MessageProcessor::new(registry.clone());

        Self {
            config,
            bootstrap,
            key_cache,
            registry,
            processor,
        }
    }

    /// Prepare the local device; call once the account is online
    pub async fn start(&self) -> SessionResult<()> {
        tracing::info!("Starting session core for {}", self.config.device_name);
        self.bootstrap.prepare().await
    }

    /// End every session, e.g. on logout
    pub async fn shutdown(&self) {
        self.registry.end_all_sessions().await;
    }
}
