//! Errors from the key and ratchet wrappers
//!
//! The session layer maps these onto [`crate::error::SessionError`] at its boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Could not generate key material: {0}")]
    KeyGenerationFailed(String),

    /// Wrong length, bad encoding, or halves that don't belong together
    #[error("Malformed key: {0}")]
    InvalidKey(String),

    #[error("Could not open an Olm session: {0}")]
    SessionCreation(String),

    #[error("Bad signature: {0}")]
    SignatureError(String),

    #[error("Could not decrypt: {0}")]
    DecryptionError(String),

    /// Base64 or byte-level framing of keys and ciphertexts
    #[error("Malformed encoding: {0}")]
    SerializationError(String),
}

impl From<vodozemac::KeyError> for CryptoError {
    fn from(e: vodozemac::KeyError) -> Self {
        CryptoError::InvalidKey(e.to_string())
    }
}

impl From<vodozemac::SignatureError> for CryptoError {
    fn from(e: vodozemac::SignatureError) -> Self {
        CryptoError::SignatureError(e.to_string())
    }
}

impl From<vodozemac::olm::SessionCreationError> for CryptoError {
    fn from(e: vodozemac::olm::SessionCreationError) -> Self {
        CryptoError::SessionCreation(e.to_string())
    }
}

impl From<vodozemac::olm::DecryptionError> for CryptoError {
    fn from(e: vodozemac::olm::DecryptionError) -> Self {
        CryptoError::DecryptionError(e.to_string())
    }
}

impl From<base64::DecodeError> for CryptoError {
    fn from(e: base64::DecodeError) -> Self {
        CryptoError::SerializationError(e.to_string())
    }
}

pub type CryptoResult<T> = Result<T, CryptoError>;
