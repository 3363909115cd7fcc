//! First-run device setup and bundle publication

use rand::Rng;
use tokio::sync::Mutex;

use crate::crypto::IdentityKeyPair;
use crate::device::bundle::BundleManager;
use crate::device::store::{DeviceIdentity, DeviceStore, MAX_DEVICE_ID};
use crate::error::{SessionError, SessionResult};

/// Largest registration id handed out (14 bits, as libsignal does)
const MAX_REGISTRATION_ID: u32 = 16380;

/// Prepares the local device: identity on first run, then one bundle publish
pub struct Bootstrap {
    device_name: String,
    store: DeviceStore,
    bundle_manager: BundleManager,
    /// Serialises `prepare` so overlapping calls can't both publish
    prepare_lock: Mutex<()>,
}

impl Bootstrap {
    pub fn new(device_name: impl Into<String>, store: DeviceStore, bundle_manager: BundleManager) -> Self {
        Self {
            device_name: device_name.into(),
            store,
            bundle_manager,
            prepare_lock: Mutex::new(()),
        }
    }

    /// Make sure the device identity exists and its bundle is published
    ///
    /// Safe to call on every start. Once the bundle is published this does
    /// nothing beyond a diagnostic; any failure before that leaves the
    /// published flag unset so the next call picks up the missing work.
    pub async fn prepare(&self) -> SessionResult<()> {
        let _guard = self.prepare_lock.lock().await;

        if !self.store.is_published().await? {
            if !self.store.is_ready().await? {
                self.setup().await?;
            }

            let identity = self
                .store
                .load_identity()
                .await?
                .ok_or_else(|| SessionError::Setup("Device identity missing after setup".to_string()))?;
            let device_id = identity.device_id;

            let bundle = self.bundle_manager.generate_bundle(identity).await?;
            self.bundle_manager.publish_bundle(device_id, &bundle).await?;
            self.store.mark_published(device_id).await?;
        }

        tracing::debug!("Local device prepared.");
        Ok(())
    }

    async fn setup(&self) -> SessionResult<()> {
        tracing::info!("Setting up local device identity");

        let (device_id, device_name, identity_key, registration_id) = tokio::try_join!(
            generate_device_id(),
            self.device_name(),
            generate_identity_key(),
            generate_registration_id(),
        )?;

        let identity = DeviceIdentity {
            device_id,
            device_name,
            identity_key,
            registration_id,
        };

        self.store.save_identity(&identity).await?;
        tracing::info!(
            "Created device {} ({}) with identity {}",
            identity.device_id,
            identity.device_name,
            identity.identity_key.fingerprint()
        );
        Ok(())
    }

    async fn device_name(&self) -> SessionResult<String> {
        let name = self.device_name.trim();
        if name.is_empty() {
            return Err(SessionError::Setup("Device name is empty".to_string()));
        }
        Ok(name.to_string())
    }
}

/// Uniform device id in [1, 2^31 - 1]
pub fn random_device_id() -> u32 {
    rand::thread_rng().gen_range(1..=MAX_DEVICE_ID)
}

async fn generate_device_id() -> SessionResult<u32> {
    Ok(random_device_id())
}

async fn generate_identity_key() -> SessionResult<IdentityKeyPair> {
    tokio::task::spawn_blocking(IdentityKeyPair::generate)
        .await
        .map_err(|e| SessionError::Setup(format!("Identity key generation failed: {}", e)))
}

async fn generate_registration_id() -> SessionResult<u32> {
    Ok(rand::thread_rng().gen_range(1..=MAX_REGISTRATION_ID))
}
