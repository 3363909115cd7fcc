//! Key store collaborator
//!
//! The core never owns durable storage. It talks to a [`KeyStore`] through
//! three calls: `get_item`, `set_item` and `register_hook`. Hooks fire on every
//! change to their key, including writes made by this process.
//!
//! [`MemoryKeyStore`] is a process-local implementation used by embedders that
//! have no persistence yet, and by the tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// Item names used by the core
pub mod keys {
    /// Packed long-term signing key
    pub const SIGNING_KEY: &str = "otr:key";
    /// Local device identity record (id, name, identity key, registration id)
    pub const DEVICE_IDENTITY: &str = "omemo:identity";
    /// Device id whose bundle has been published
    pub const BUNDLE_PUBLISHED: &str = "omemo:published";
    /// Secret halves of the published prekeys
    pub const PREKEYS: &str = "omemo:prekeys";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Key store unavailable: {0}")]
    Unavailable(String),

    #[error("Write to {key} failed: {reason}")]
    WriteFailed { key: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Change callback, called with the new value (`None` if the item was
/// cleared outside the core)
pub type StoreHook = Box<dyn Fn(Option<&str>) + Send + Sync>;

/// Durable key/value storage with change notification
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get_item(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_item(&self, key: &str, value: String) -> StoreResult<()>;

    /// Register a callback for changes to `key`
    async fn register_hook(&self, key: &str, hook: StoreHook);
}

/// In-memory [`KeyStore`]
#[derive(Default)]
pub struct MemoryKeyStore {
    items: RwLock<HashMap<String, String>>,
    hooks: RwLock<HashMap<String, Vec<Arc<StoreHook>>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn notify(&self, key: &str, value: Option<&str>) {
        // Clone the callbacks out so a hook may touch the store again
        let hooks: Vec<Arc<StoreHook>> = self
            .hooks
            .read()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default();

        for hook in hooks {
            (**hook)(value);
        }
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn get_item(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> StoreResult<()> {
        tracing::trace!("Storing item {}", key);
        self.items.write().await.insert(key.to_string(), value.clone());
        self.notify(key, Some(value.as_str())).await;
        Ok(())
    }

    async fn register_hook(&self, key: &str, hook: StoreHook) {
        self.hooks
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .push(Arc::new(hook));
    }
}
