//! Process-wide cache of the long-term signing key
//!
//! The key is loaded (or generated and persisted) at most once, no matter how
//! many sessions ask for it at the same time. After that it is read-only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{OnceCell, SetError};

use crate::config::KeyGenerationMode;
use crate::crypto::SigningKey;
use crate::error::{SessionError, SessionResult};
use crate::storage::{keys, KeyStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCacheState {
    Unloaded,
    Loading,
    Loaded,
}

pub struct KeyMaterialCache {
    store: Arc<dyn KeyStore>,
    mode: KeyGenerationMode,
    key: OnceCell<Arc<SigningKey>>,
    loading: AtomicBool,
}

/// Clears the loading flag even if the load future is dropped midway
struct LoadingGuard<'a>(&'a AtomicBool);

impl<'a> LoadingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl KeyMaterialCache {
    /// Create the cache and subscribe it to signing key changes in the store
    pub async fn new(store: Arc<dyn KeyStore>, mode: KeyGenerationMode) -> Arc<Self> {
        let cache = Arc::new(Self {
            store: store.clone(),
            mode,
            key: OnceCell::new(),
            loading: AtomicBool::new(false),
        });

        let weak: Weak<Self> = Arc::downgrade(&cache);
        store
            .register_hook(
                keys::SIGNING_KEY,
                Box::new(move |value: Option<&str>| {
                    if let (Some(cache), Some(packed)) = (weak.upgrade(), value) {
                        cache.on_store_change(packed);
                    }
                }),
            )
            .await;

        cache
    }

    pub fn state(&self) -> KeyCacheState {
        if self.key.initialized() {
            KeyCacheState::Loaded
        } else if self.loading.load(Ordering::SeqCst) {
            KeyCacheState::Loading
        } else {
            KeyCacheState::Unloaded
        }
    }

    /// The signing key, loading or generating it on first use
    ///
    /// Concurrent callers share one load. A failed load leaves the cache
    /// unloaded so the next call tries again.
    pub async fn get(&self) -> SessionResult<Arc<SigningKey>> {
        self.key
            .get_or_try_init(|| async {
                let _loading = LoadingGuard::enter(&self.loading);
                self.load_or_generate().await.map(Arc::new)
            })
            .await
            .cloned()
    }

    async fn load_or_generate(&self) -> SessionResult<SigningKey> {
        if let Some(packed) = self.store.get_item(keys::SIGNING_KEY).await? {
            let key = SigningKey::parse_private(&packed).map_err(|e| {
                SessionError::CorruptKeyStore(format!("Stored signing key is unreadable: {}", e))
            })?;
            tracing::info!("Signing key loaded ({})", key.fingerprint());
            return Ok(key);
        }

        let key = self.generate().await?;
        self.store
            .set_item(keys::SIGNING_KEY, key.pack_private().as_str().to_owned())
            .await?;
        tracing::info!("Signing key generated ({})", key.fingerprint());
        Ok(key)
    }

    async fn generate(&self) -> SessionResult<SigningKey> {
        match self.mode {
            KeyGenerationMode::Worker => tokio::task::spawn_blocking(SigningKey::generate)
                .await
                .map_err(|e| SessionError::KeyGeneration(e.to_string())),
            KeyGenerationMode::Inline => Ok(SigningKey::generate()),
            KeyGenerationMode::Disabled => Err(SessionError::KeyGeneration(
                "Key generation is disabled on this platform".to_string(),
            )),
        }
    }

    fn on_store_change(&self, packed: &str) {
        let incoming = match SigningKey::parse_private(packed) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!("Ignoring unreadable signing key from store: {}", e);
                return;
            }
        };

        if let Some(current) = self.key.get() {
            self.compare(current, &incoming);
            return;
        }

        if self.loading.load(Ordering::SeqCst) {
            tracing::debug!("Signing key changed while loading, the load wins");
            return;
        }

        match self.key.set(Arc::new(incoming)) {
            Ok(()) => tracing::info!("Signing key adopted from store"),
            Err(SetError::AlreadyInitializedError(incoming)) => {
                if let Some(current) = self.key.get() {
                    self.compare(current, &incoming);
                }
            }
            Err(SetError::InitializingError(_)) => {
                tracing::debug!("Signing key changed while loading, the load wins");
            }
        }
    }

    fn compare(&self, current: &SigningKey, incoming: &SigningKey) {
        if current != incoming {
            tracing::warn!(
                "Two different signing keys: keeping {}, ignoring {}",
                current.fingerprint(),
                incoming.fingerprint()
            );
        }
    }
}
