//! Prekey generation for device bundles
//!
//! Each bundle carries one signed prekey and a batch of one-time prekeys. The
//! secrets are handed to the key store as [`StoredPreKey`] records; only the
//! public halves leave the device.

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{
    Curve25519KeyPair, IdentityKeyPair, OneTimePreKey, SignedPreKey, StoredPreKey,
};

/// Id of the signed prekey; one-time prekeys are numbered after it
const SIGNED_PREKEY_ID: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreKeyConfig {
    /// Number of one-time prekeys in a fresh bundle
    pub initial_batch_size: usize,
}

impl Default for PreKeyConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: 100,
        }
    }
}

/// One generation of prekeys for the local device
///
/// CPU-bound for large batches; callers on the async runtime should build it
/// on the blocking pool.
pub struct PreKeyManager {
    identity: IdentityKeyPair,
    signed: Curve25519KeyPair,
    pool: Vec<(u32, Curve25519KeyPair)>,
}

impl PreKeyManager {
    pub fn with_config(identity: IdentityKeyPair, config: PreKeyConfig) -> Self {
        let pool = (0..config.initial_batch_size as u32)
            .map(|offset| (SIGNED_PREKEY_ID + 1 + offset, Curve25519KeyPair::generate()))
            .collect();

        Self {
            identity,
            signed: Curve25519KeyPair::generate(),
            pool,
        }
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    /// The signed prekey in its publishable form
    pub fn signed_prekey(&self) -> SignedPreKey {
        SignedPreKey::new(SIGNED_PREKEY_ID, &self.signed, &self.identity)
    }

    pub fn one_time_prekeys(&self) -> Vec<OneTimePreKey> {
        self.pool
            .iter()
            .map(|(key_id, pair)| OneTimePreKey::new(*key_id, pair))
            .collect()
    }

    /// Secret material for persistence, signed prekey first
    pub fn stored_prekeys(&self) -> Vec<StoredPreKey> {
        let signed = StoredPreKey::from_keypair(SIGNED_PREKEY_ID, &self.signed, true);
        let pool = self
            .pool
            .iter()
            .map(|(key_id, pair)| StoredPreKey::from_keypair(*key_id, pair, false));

        std::iter::once(signed).chain(pool).collect()
    }
}
