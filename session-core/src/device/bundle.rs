//! Public key bundle for the local device
//!
//! A bundle advertises the identity key, registration id, a signed prekey and
//! a batch of one-time prekeys so peers can start sessions without prior
//! contact. It is rebuilt on demand and never persisted here; publication is
//! delegated to a [`BundlePublisher`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vodozemac::Ed25519PublicKey;

use crate::crypto::{CryptoError, CryptoResult, OneTimePreKey, PreKeyConfig, PreKeyManager, SignedPreKey};
use crate::device::store::{DeviceIdentity, DeviceStore};
use crate::error::{SessionError, SessionResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub registration_id: u32,
    /// Ed25519 identity public key
    pub identity_key: Vec<u8>,
    pub signed_prekey: SignedPreKey,
    pub prekeys: Vec<OneTimePreKey>,
}

impl Bundle {
    pub fn identity_key(&self) -> CryptoResult<Ed25519PublicKey> {
        let arr: [u8; 32] = self
            .identity_key
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Identity key must be 32 bytes".to_string()))?;
        Ok(Ed25519PublicKey::from_slice(&arr)?)
    }

    /// Check the signed prekey was signed by the advertised identity key
    pub fn verify(&self) -> CryptoResult<()> {
        self.signed_prekey.verify(&self.identity_key()?)
    }
}

/// Publishes bundles to wherever peers fetch them from
#[async_trait]
pub trait BundlePublisher: Send + Sync {
    async fn publish_bundle(&self, device_id: u32, bundle: &Bundle) -> Result<(), String>;
}

/// Builds bundles from the device identity and hands them to the publisher
pub struct BundleManager {
    store: DeviceStore,
    publisher: Arc<dyn BundlePublisher>,
    config: PreKeyConfig,
}

impl BundleManager {
    pub fn new(store: DeviceStore, publisher: Arc<dyn BundlePublisher>, config: PreKeyConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Generate fresh prekeys for `identity` and return the public bundle
    ///
    /// The prekey secrets are written to the key store before the bundle is
    /// returned, so a published prekey always has its secret on disk.
    pub async fn generate_bundle(&self, identity: DeviceIdentity) -> SessionResult<Bundle> {
        let registration_id = identity.registration_id;
        let config = self.config.clone();

        let manager = tokio::task::spawn_blocking(move || {
            PreKeyManager::with_config(identity.identity_key, config)
        })
        .await
        .map_err(|e| SessionError::Setup(format!("Prekey generation task failed: {}", e)))?;

        self.store.save_prekeys(&manager.stored_prekeys()).await?;

        Ok(Bundle {
            registration_id,
            identity_key: manager.identity().public_key_bytes(),
            signed_prekey: manager.signed_prekey(),
            prekeys: manager.one_time_prekeys(),
        })
    }

    pub async fn publish_bundle(&self, device_id: u32, bundle: &Bundle) -> SessionResult<()> {
        self.publisher
            .publish_bundle(device_id, bundle)
            .await
            .map_err(SessionError::Publish)?;

        tracing::info!(
            "Published bundle for device {} with {} prekeys",
            device_id,
            bundle.prekeys.len()
        );
        Ok(())
    }
}
