//! Key types and generation
//!
//! This module defines the key types used by the session core:
//! - Identity keys (Ed25519) for the local device identity advertised in bundles
//! - The long-term signing key (Ed25519) used to authenticate key exchanges
//! - Curve25519 keys for prekeys
//! - Signed and one-time prekeys carried in a bundle

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use vodozemac::{
    Curve25519PublicKey, Curve25519SecretKey, Ed25519PublicKey, Ed25519SecretKey,
    Ed25519Signature,
};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::errors::{CryptoError, CryptoResult};

/// Ed25519 identity of this device, advertised in its bundle
///
/// Signs the bundle's prekey. Its fingerprint is what a user compares out of band.
pub struct IdentityKeyPair {
    pub public: Ed25519PublicKey,
    secret: Ed25519SecretKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let secret = Ed25519SecretKey::new();
        let public = secret.public_key();
        Self { public, secret }
    }

    /// Restore from existing secret key bytes
    ///
    /// The public half is always re-derived so a stored pair can't disagree
    /// with itself.
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> CryptoResult<Self> {
        let secret_arr: Zeroizing<[u8; 32]> = Zeroizing::new(
            secret_bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("Secret key must be 32 bytes".to_string()))?,
        );

        let secret = Ed25519SecretKey::from_slice(&secret_arr);
        let public = secret.public_key();
        Ok(Self { public, secret })
    }

    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        self.secret.sign(message)
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }

    /// Wiped when the returned buffer is dropped
    pub fn secret_key_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }

    /// Short hex digest of the public key
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public)
    }

    /// Serializable form for the key store
    pub fn to_stored(&self) -> StoredIdentityKey {
        StoredIdentityKey {
            public_key: STANDARD.encode(self.public.as_bytes()),
            secret_key: STANDARD.encode(self.secret_key_bytes().as_slice()),
        }
    }

    /// Restore from the key store form, checking both halves agree
    pub fn from_stored(stored: &StoredIdentityKey) -> CryptoResult<Self> {
        let secret = Zeroizing::new(STANDARD.decode(&stored.secret_key)?);
        let pair = Self::from_secret_bytes(&secret)?;

        if STANDARD.encode(pair.public.as_bytes()) != stored.public_key {
            return Err(CryptoError::InvalidKey(
                "Stored public key does not match secret key".to_string(),
            ));
        }

        Ok(pair)
    }
}

/// Identity key as persisted in the key store (base64 halves)
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredIdentityKey {
    pub public_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for StoredIdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredIdentityKey")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Long-term signing key used to authenticate key exchanges with peers
///
/// One per process. Loaded from (or generated and written to) the key store
/// by [`crate::otr::KeyMaterialCache`] and shared read-only by every session.
pub struct SigningKey {
    inner: IdentityKeyPair,
}

impl SigningKey {
    /// Generate a fresh signing key
    pub fn generate() -> Self {
        Self {
            inner: IdentityKeyPair::generate(),
        }
    }

    /// Pack the private key into its storage string
    pub fn pack_private(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.inner.secret_key_bytes().as_slice()))
    }

    /// Parse a key previously produced by [`SigningKey::pack_private`]
    pub fn parse_private(packed: &str) -> CryptoResult<Self> {
        let bytes = Zeroizing::new(STANDARD.decode(packed.trim())?);
        Ok(Self {
            inner: IdentityKeyPair::from_secret_bytes(&bytes)?,
        })
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        self.inner.public
    }

    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        self.inner.sign(message)
    }

    pub fn fingerprint(&self) -> String {
        self.inner.fingerprint()
    }
}

impl PartialEq for SigningKey {
    fn eq(&self, other: &Self) -> bool {
        self.inner.public == other.inner.public
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Short SHA-256 fingerprint of an Ed25519 public key
pub fn fingerprint(public: &Ed25519PublicKey) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(public.as_bytes());
    hex::encode(&hash[..8])
}

/// Verify a detached signature made by `public`
pub fn verify_signature(
    public: &Ed25519PublicKey,
    message: &[u8],
    signature: &Ed25519Signature,
) -> CryptoResult<()> {
    public
        .verify(message, signature)
        .map_err(|e| CryptoError::SignatureError(e.to_string()))
}

/// Curve25519 key pair backing a prekey
pub struct Curve25519KeyPair {
    pub public: Curve25519PublicKey,
    secret: Curve25519SecretKey,
}

impl Curve25519KeyPair {
    pub fn generate() -> Self {
        let secret = Curve25519SecretKey::new();
        Self {
            public: Curve25519PublicKey::from(&secret),
            secret,
        }
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.to_vec()
    }

    pub fn secret_key_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }
}

/// Prekey signed by the device identity key, as published in a bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKey {
    pub key_id: u32,
    pub public_key: Vec<u8>,
    /// Ed25519 signature over `public_key`
    pub signature: Vec<u8>,
    /// Unix seconds
    pub created_at: i64,
}

impl SignedPreKey {
    pub fn new(key_id: u32, pair: &Curve25519KeyPair, identity: &IdentityKeyPair) -> Self {
        let public_key = pair.public_key_bytes();
        Self {
            key_id,
            signature: identity.sign(&public_key).to_bytes().to_vec(),
            public_key,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn verify(&self, identity: &Ed25519PublicKey) -> CryptoResult<()> {
        let signature = Ed25519Signature::from_slice(&self.signature)?;
        verify_signature(identity, &self.public_key, &signature)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKey {
    pub key_id: u32,
    pub public_key: Vec<u8>,
}

impl OneTimePreKey {
    pub fn new(key_id: u32, pair: &Curve25519KeyPair) -> Self {
        Self {
            key_id,
            public_key: pair.public_key_bytes(),
        }
    }
}

/// Prekey with its secret half, as kept in the local key store
///
/// The secret is wiped when the record is dropped.
#[derive(Serialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct StoredPreKey {
    #[zeroize(skip)]
    pub key_id: u32,
    #[zeroize(skip)]
    pub public_key: Vec<u8>,
    pub secret_key: Vec<u8>,
    #[zeroize(skip)]
    pub is_signed: bool,
}

impl StoredPreKey {
    pub fn from_keypair(key_id: u32, pair: &Curve25519KeyPair, is_signed: bool) -> Self {
        Self {
            key_id,
            public_key: pair.public_key_bytes(),
            secret_key: pair.secret_key_bytes().to_vec(),
            is_signed,
        }
    }
}
