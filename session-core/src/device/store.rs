//! Local device identity persisted through the key store

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::{IdentityKeyPair, StoredIdentityKey, StoredPreKey};
use crate::error::{SessionError, SessionResult};
use crate::storage::{keys, KeyStore};

/// Largest device id (2^31 - 1)
pub const MAX_DEVICE_ID: u32 = 0x7FFF_FFFF;

/// The local device identity
pub struct DeviceIdentity {
    pub device_id: u32,
    pub device_name: String,
    pub identity_key: IdentityKeyPair,
    pub registration_id: u32,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .field("fingerprint", &self.identity_key.fingerprint())
            .field("registration_id", &self.registration_id)
            .finish()
    }
}

/// On-disk record. Every field is optional so a half-written record reads as
/// "not ready" instead of failing to parse.
#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredDeviceIdentity {
    device_id: Option<u32>,
    device_name: Option<String>,
    identity_key: Option<StoredIdentityKey>,
    registration_id: Option<u32>,
}

/// Typed access to the device items in a [`KeyStore`]
#[derive(Clone)]
pub struct DeviceStore {
    store: Arc<dyn KeyStore>,
}

impl DeviceStore {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    /// Load the identity if all four fields are present
    ///
    /// Returns `Ok(None)` for a missing or incomplete record, and
    /// [`SessionError::CorruptKeyStore`] for one that can't be decoded.
    pub async fn load_identity(&self) -> SessionResult<Option<DeviceIdentity>> {
        let Some(raw) = self.store.get_item(keys::DEVICE_IDENTITY).await? else {
            return Ok(None);
        };

        let stored: StoredDeviceIdentity = serde_json::from_str(&raw)
            .map_err(|e| SessionError::CorruptKeyStore(format!("Device identity record: {}", e)))?;

        let (Some(device_id), Some(device_name), Some(identity_key), Some(registration_id)) = (
            stored.device_id,
            stored.device_name,
            stored.identity_key,
            stored.registration_id,
        ) else {
            tracing::warn!("Device identity record is incomplete, ignoring it");
            return Ok(None);
        };

        if device_id == 0 || device_id > MAX_DEVICE_ID {
            return Err(SessionError::CorruptKeyStore(format!(
                "Device id {} out of range",
                device_id
            )));
        }

        let identity_key = IdentityKeyPair::from_stored(&identity_key)
            .map_err(|e| SessionError::CorruptKeyStore(format!("Identity key: {}", e)))?;

        Ok(Some(DeviceIdentity {
            device_id,
            device_name,
            identity_key,
            registration_id,
        }))
    }

    pub async fn is_ready(&self) -> SessionResult<bool> {
        Ok(self.load_identity().await?.is_some())
    }

    /// Persist all four fields in a single write
    pub async fn save_identity(&self, identity: &DeviceIdentity) -> SessionResult<()> {
        let stored = StoredDeviceIdentity {
            device_id: Some(identity.device_id),
            device_name: Some(identity.device_name.clone()),
            identity_key: Some(identity.identity_key.to_stored()),
            registration_id: Some(identity.registration_id),
        };

        self.store
            .set_item(keys::DEVICE_IDENTITY, serde_json::to_string(&stored)?)
            .await?;
        Ok(())
    }

    /// Whether the bundle of the current device id has been published
    pub async fn is_published(&self) -> SessionResult<bool> {
        let Some(published) = self.store.get_item(keys::BUNDLE_PUBLISHED).await? else {
            return Ok(false);
        };

        Ok(match self.load_identity().await? {
            Some(identity) => published.parse::<u32>().ok() == Some(identity.device_id),
            None => false,
        })
    }

    pub async fn mark_published(&self, device_id: u32) -> SessionResult<()> {
        self.store
            .set_item(keys::BUNDLE_PUBLISHED, device_id.to_string())
            .await?;
        Ok(())
    }

    pub async fn save_prekeys(&self, prekeys: &[StoredPreKey]) -> SessionResult<()> {
        self.store
            .set_item(keys::PREKEYS, serde_json::to_string(prekeys)?)
            .await?;
        Ok(())
    }
}
